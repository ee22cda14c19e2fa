//! Reconcilers with host side effects, machine status and boot facts.

mod diagnostics;
mod extension_config;
mod facts;
mod fs_scrub;
mod machine_status;
mod maintenance;
mod memfd_bind;
mod oom;
mod seccomp;
mod upgrade_fallback;
mod watchdog;

pub use diagnostics::{
    default_checks, DiagnosticCheck, DiagnosticsController, DiagnosticsLoggerController, FailedScrubs, RecentOomKills,
    UnsupportedKernelParams, CHECK_INTERVAL, CHECK_TIMEOUT,
};
pub use extension_config::{config_file_name, ExtensionServicesConfigFilesController};
pub use facts::{
    read_extensions, read_sbom, BootedEntryController, ExtensionStatusController, SBOMItemController,
    SecurityStateController,
};
pub use fs_scrub::{random_first_delay, FSScrubController, FirstDelay};
pub use machine_status::{
    readiness, status_event, MachineStatusController, MachineStatusPublisher, StageTracker, CONTROL_PLANE_SERVICES,
    REQUIRED_SERVICES,
};
pub use maintenance::{MaintenanceHandler, MaintenanceServiceController};
pub use memfd_bind::{BoundMount, MemfdBindController, MemfdRebinder, Rebinder};
pub use oom::{select_victim, OomController, RankedCgroup, ACTION_LOG_KEEP, DEFAULT_SAMPLE_INTERVAL};
pub use seccomp::SeccompProfileFileController;
pub use upgrade_fallback::DropUpgradeFallbackController;
pub use watchdog::WatchdogTimerController;
