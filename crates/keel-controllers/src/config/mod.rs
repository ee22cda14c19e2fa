//! Projection controllers: fan the machine configuration out into spec resources.

use std::sync::Arc;

use keel_resources::config::MachineConfig;
use keel_resources::document::MachineConfigDocument;
use keel_runtime::{ControllerResult, ControllerRuntime, Input};

mod kernel;
mod logging;
mod machine_type;
mod runtime;

pub use kernel::{KernelModuleConfigController, KernelParamConfigController, KernelParamDefaultsController, KSPP_DEFAULTS};
pub use logging::{EventSinkConfigController, KmsgLogConfigController};
pub use machine_type::MachineTypeController;
pub use runtime::{
    ExtensionServicesConfigController, FSScrubConfigController, MaintenanceConfigController, SeccompProfileController,
    WatchdogTimerConfigController,
};

/// Input on the active machine configuration.
pub fn machine_config_input() -> Input {
    Input::weak::<MachineConfig>().with_id(MachineConfig::ACTIVE_ID)
}

/// The active machine configuration document, if loaded.
pub fn active_machine_config(r: &ControllerRuntime) -> ControllerResult<Option<Arc<MachineConfigDocument>>> {
    Ok(r.get::<MachineConfig>(MachineConfig::ACTIVE_ID)?
        .map(|cfg| Arc::clone(&cfg.spec.document)))
}
