//! Builds and registers the full controller set.

use std::sync::Arc;

use keel_api::EventPayload;
use keel_runtime::{ControllerError, Drainer, EventStream, Runtime, RuntimeError};
use thiserror::Error;
use tracing::info;

use crate::config::{
    EventSinkConfigController, ExtensionServicesConfigController, FSScrubConfigController, KernelModuleConfigController,
    KernelParamConfigController, KernelParamDefaultsController, KmsgLogConfigController, MachineTypeController,
    MaintenanceConfigController, SeccompProfileController, WatchdogTimerConfigController,
};
use crate::cri::{ImageCacheConfigController, ImageGCController, RegistriesConfigController};
use crate::kernel::{KernelCmdlineController, KernelModuleSpecController, KernelParamSpecController, LoadedKernelModuleController};
use crate::logging::{
    kmsg_follower, EventsSinkController, KmsgLogDeliveryController, LogPersistence, LogPersistenceConfig,
    LogPersistenceController,
};
use crate::paths::SystemPaths;
use crate::runtime::{
    default_checks, BootedEntryController, DiagnosticsController, DiagnosticsLoggerController,
    DropUpgradeFallbackController, ExtensionServicesConfigFilesController, ExtensionStatusController, FSScrubController,
    MachineStatusController, MachineStatusPublisher, MaintenanceServiceController, MemfdBindController, MemfdRebinder,
    OomController, SBOMItemController, SeccompProfileFileController, SecurityStateController, WatchdogTimerController,
};
use crate::sys::kernel_param::KernelParams;
use crate::sys::meta::{FileMeta, MetaStore};
use crate::sys::modules::KernelModules;
use crate::sys::scrub::XfsScrub;
use crate::sys::watchdog::DeviceOpener;

/// Failure to assemble the catalogue.
#[derive(Debug, Error)]
pub enum CatalogueError {
    /// A controller couldn't be built.
    #[error("building controller: {0}")]
    Build(#[from] ControllerError),

    /// The runtime rejected a controller.
    #[error(transparent)]
    Register(#[from] RuntimeError),
}

/// Process-wide dependencies of the controllers.
#[derive(Clone)]
pub struct Catalogue {
    /// Host paths.
    pub paths: SystemPaths,
    /// Machine event stream.
    pub events: EventStream<EventPayload>,
    /// Shutdown drain coordinator.
    pub drainer: Drainer,
    /// Running inside a container; host-only side effects are skipped.
    pub container_mode: bool,
    /// Service log file tuning.
    pub log_persistence: LogPersistenceConfig,
}

impl std::fmt::Debug for Catalogue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalogue")
            .field("paths", &self.paths)
            .field("container_mode", &self.container_mode)
            .field("log_persistence", &self.log_persistence)
            .finish()
    }
}

impl Catalogue {
    /// Catalogue over the given paths and event stream.
    pub fn new(paths: SystemPaths, events: EventStream<EventPayload>, drainer: Drainer) -> Self {
        Catalogue {
            paths,
            events,
            drainer,
            container_mode: false,
            log_persistence: LogPersistenceConfig::default(),
        }
    }

    /// Registers every controller with `runtime`.
    ///
    /// Returns the writer for service log files.
    pub fn register(&self, runtime: &mut Runtime) -> Result<LogPersistence, CatalogueError> {
        let paths = &self.paths;
        let meta: Arc<dyn MetaStore> = Arc::new(FileMeta::new(&paths.meta_dir));

        // configuration projections
        runtime.register(MachineTypeController)?;
        runtime.register(KernelParamConfigController)?;
        runtime.register(KernelParamDefaultsController)?;
        runtime.register(KernelModuleConfigController)?;
        runtime.register(KmsgLogConfigController)?;
        runtime.register(EventSinkConfigController)?;
        runtime.register(WatchdogTimerConfigController)?;
        runtime.register(FSScrubConfigController)?;
        runtime.register(SeccompProfileController)?;
        runtime.register(ExtensionServicesConfigController)?;
        runtime.register(MaintenanceConfigController)?;

        // kernel
        runtime.register(KernelCmdlineController::new(&paths.proc))?;
        runtime.register(KernelParamSpecController::new(KernelParams::new(&paths.kernel_params_root)))?;
        let modules = KernelModules::for_running_kernel(&paths.modules_root).map_err(ControllerError::from)?;
        runtime.register(KernelModuleSpecController::new(modules))?;
        runtime.register(LoadedKernelModuleController::new(&paths.proc))?;

        // container runtime
        runtime.register(ImageCacheConfigController::new()?)?;
        runtime.register(RegistriesConfigController::new())?;
        runtime.register(ImageGCController::with_socket("cri", true, &paths.cri_socket))?;
        runtime.register(ImageGCController::with_socket("containerd", false, &paths.containerd_socket))?;

        // host reconcilers and facts
        runtime.register(SecurityStateController::new(
            &paths.efivars,
            &paths.lockdown,
            &paths.module_sig_enforce,
        ))?;
        runtime.register(BootedEntryController::new(&paths.efivars))?;
        runtime.register(ExtensionStatusController::new(&paths.extensions_dir))?;
        runtime.register(SBOMItemController::new(&paths.spdx_dir))?;
        runtime.register(SeccompProfileFileController::new(&paths.seccomp_dir))?;
        runtime.register(ExtensionServicesConfigFilesController::new(&paths.extension_config_dir))?;
        runtime.register(MemfdBindController::new(
            &paths.runc,
            self.container_mode,
            Arc::new(MemfdRebinder),
        ))?;
        runtime.register(WatchdogTimerController::new(Arc::new(DeviceOpener)))?;
        runtime.register(FSScrubController::new(Arc::new(XfsScrub::new(&paths.xfs_scrub))))?;
        runtime.register(OomController::new(&paths.cgroup_root, &paths.proc)?)?;
        runtime.register(DropUpgradeFallbackController::new(Arc::clone(&meta)))?;
        runtime.register(MaintenanceServiceController::new(meta))?;

        // status
        runtime.register(MachineStatusController::new(self.events.clone()))?;
        runtime.register(MachineStatusPublisher::new(self.events.clone()))?;
        runtime.register(DiagnosticsController::new(default_checks()))?;
        runtime.register(DiagnosticsLoggerController::default())?;

        // delivery
        runtime.register(EventsSinkController::new(self.events.clone(), self.drainer.clone()))?;
        runtime.register(KmsgLogDeliveryController::new(
            kmsg_follower(&paths.kmsg),
            self.drainer.clone(),
        ))?;
        let persistence = LogPersistenceController::new(self.log_persistence.clone());
        let writer = persistence.writer();
        runtime.register(persistence)?;

        info!("controller catalogue registered");
        Ok(writer)
    }
}
