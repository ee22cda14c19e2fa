//! Kinds in the `runtime` namespace: kernel, watchdog, scrub, extension,
//! maintenance and machine status resources.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RUNTIME_NAMESPACE;

/// A sysctl or sysfs value to apply, keyed by dotted path (`proc.sys.net.ipv4.ip_forward`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelParamSpec {
    /// Value to write.
    pub value: String,
    /// Tolerate the parameter being absent from the kernel.
    pub ignore_errors: bool,
}
resource!(KernelParamSpec, "KernelParamSpecs.runtime.keel.dev", RUNTIME_NAMESPACE);

/// A hardening default for a kernel parameter; a [`KernelParamSpec`] with the same id wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelParamDefaultSpec {
    /// Value to write.
    pub value: String,
    /// Tolerate the parameter being absent from the kernel.
    pub ignore_errors: bool,
}
resource!(KernelParamDefaultSpec, "KernelParamDefaultSpecs.runtime.keel.dev", RUNTIME_NAMESPACE);

/// Observed state of an applied kernel parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelParamStatus {
    /// Value currently in effect.
    pub current: String,
    /// Value before the first application; empty if the parameter did not exist.
    pub default: String,
    /// The kernel does not expose the parameter.
    pub unsupported: bool,
}
resource!(KernelParamStatus, "KernelParamStatuses.runtime.keel.dev", RUNTIME_NAMESPACE);

/// A kernel module to load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelModuleSpec {
    /// Module name.
    pub name: String,
    /// Module parameters, `key=value`.
    pub parameters: Vec<String>,
}
resource!(KernelModuleSpec, "KernelModuleSpecs.runtime.keel.dev", RUNTIME_NAMESPACE);

/// Result of loading a kernel module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelModuleStatus {
    /// Module name.
    pub name: String,
    /// Modules loaded for it, dependencies first.
    pub loaded: Vec<String>,
}
resource!(KernelModuleStatus, "KernelModuleStatuses.runtime.keel.dev", RUNTIME_NAMESPACE);

/// A module listed in `/proc/modules`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadedKernelModule {
    /// Module size in bytes.
    pub size: u64,
    /// Number of references.
    pub reference_count: u32,
    /// Modules using this one.
    pub dependencies: Vec<String>,
    /// `Live`, `Loading` or `Unloading`.
    pub state: String,
    /// Load address as printed by the kernel.
    pub address: String,
}
resource!(LoadedKernelModule, "LoadedKernelModules.runtime.keel.dev", RUNTIME_NAMESPACE);

/// The kernel command line, read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelCmdline {
    /// Whitespace-trimmed command line.
    pub cmdline: String,
}
resource!(KernelCmdline, "KernelCmdlines.runtime.keel.dev", RUNTIME_NAMESPACE);

impl KernelCmdline {
    /// Singleton id.
    pub const ID: &'static str = "cmdline";

    /// Returns the last value of `key=value`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.cmdline
            .split_whitespace()
            .filter_map(|arg| arg.split_once('='))
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .last()
    }

    /// Returns every value of `key=value`, in order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.cmdline
            .split_whitespace()
            .filter_map(|arg| arg.split_once('='))
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .collect()
    }
}

/// Kernel log forwarding destinations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KmsgLogConfig {
    /// Destination URLs.
    pub destinations: Vec<String>,
}
resource!(KmsgLogConfig, "KmsgLogConfigs.runtime.keel.dev", RUNTIME_NAMESPACE);

impl KmsgLogConfig {
    /// Singleton id.
    pub const ID: &'static str = "kmsg-log";
}

/// Event sink destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSinkConfig {
    /// `host:port` of the sink.
    pub endpoint: String,
}
resource!(EventSinkConfig, "EventSinkConfigs.runtime.keel.dev", RUNTIME_NAMESPACE);

impl EventSinkConfig {
    /// Singleton id.
    pub const ID: &'static str = "event-sink";
}

/// Watchdog device and timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchdogTimerConfig {
    /// Character device path.
    pub device: String,
    /// Reboot timeout.
    pub timeout: Duration,
}
resource!(WatchdogTimerConfig, "WatchdogTimerConfigs.runtime.keel.dev", RUNTIME_NAMESPACE);

impl WatchdogTimerConfig {
    /// Singleton id.
    pub const ID: &'static str = "timer";
}

/// Watchdog feeding state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchdogTimerStatus {
    /// Device being fed.
    pub device: String,
    /// Timeout set on the device.
    pub timeout: Duration,
    /// Interval between keepalives.
    pub feed_interval: Duration,
}
resource!(WatchdogTimerStatus, "WatchdogTimerStatuses.runtime.keel.dev", RUNTIME_NAMESPACE);

impl WatchdogTimerStatus {
    /// Singleton id.
    pub const ID: &'static str = "timer";
}

/// A periodic scrub of the filesystem mounted at `mountpoint`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FSScrubConfig {
    /// Scrub name.
    pub name: String,
    /// Mount point.
    pub mountpoint: String,
    /// Interval between runs.
    pub period: Duration,
}
resource!(FSScrubConfig, "FSScrubConfigs.runtime.keel.dev", RUNTIME_NAMESPACE);

/// Most recent scrub run for a mount point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FSScrubStatus {
    /// Mount point.
    pub mountpoint: String,
    /// Configured period.
    pub period: Duration,
    /// Start of the last run, or the planned start of the first.
    pub time: Option<DateTime<Utc>>,
    /// Duration of the last run.
    pub duration: Duration,
    /// `success`, `scheduled` or the error message.
    pub status: String,
}
resource!(FSScrubStatus, "FSScrubStatuses.runtime.keel.dev", RUNTIME_NAMESPACE);

/// Maintenance API listener settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceServiceConfig {
    /// `host:port` to listen on.
    pub listen_address: String,
    /// Addresses the machine can be reached at.
    pub reachable_addresses: Vec<IpAddr>,
}
resource!(MaintenanceServiceConfig, "MaintenanceServiceConfigs.runtime.keel.dev", RUNTIME_NAMESPACE);

impl MaintenanceServiceConfig {
    /// Singleton id.
    pub const ID: &'static str = "maintenance";
}

/// Requests the maintenance API to run while it exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceServiceRequest {}
resource!(MaintenanceServiceRequest, "MaintenanceServiceRequests.runtime.keel.dev", RUNTIME_NAMESPACE);

impl MaintenanceServiceRequest {
    /// Singleton id.
    pub const ID: &'static str = "maintenance";
}

/// A seccomp profile written to the profile directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeccompProfile {
    /// File name.
    pub name: String,
    /// Profile body.
    pub value: serde_json::Value,
}
resource!(SeccompProfile, "SeccompProfiles.runtime.keel.dev", RUNTIME_NAMESPACE);

/// A file rendered for an extension service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionServiceConfigFile {
    /// File content.
    pub content: String,
    /// Mount path inside the service.
    pub mount_path: String,
}

/// Configuration files of one extension service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionServicesConfig {
    /// Files to render.
    pub files: Vec<ExtensionServiceConfigFile>,
    /// Environment, `KEY=value`.
    pub environment: Vec<String>,
}
resource!(ExtensionServicesConfig, "ExtensionServicesConfigs.runtime.keel.dev", RUNTIME_NAMESPACE);

/// Machine lifecycle stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStage {
    /// No events seen yet.
    #[default]
    Unknown,
    /// Boot or initialize sequence running.
    Booting,
    /// Installing to disk.
    Installing,
    /// Waiting for configuration.
    Maintenance,
    /// Booted.
    Running,
    /// Rebooting.
    Rebooting,
    /// Shutting down.
    ShuttingDown,
    /// Resetting.
    Resetting,
    /// Upgrading.
    Upgrading,
}

/// A readiness check that did not pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetCondition {
    /// Check name.
    pub name: String,
    /// Why it failed.
    pub reason: String,
}

/// Aggregated readiness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatusStatus {
    /// All checks passed.
    pub ready: bool,
    /// Failed checks.
    pub unmet_conditions: Vec<UnmetCondition>,
}

/// Machine stage and readiness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    /// Current stage.
    pub stage: MachineStage,
    /// Readiness.
    pub status: MachineStatusStatus,
}
resource!(MachineStatus, "MachineStatuses.runtime.keel.dev", RUNTIME_NAMESPACE);

impl MachineStatus {
    /// Singleton id.
    pub const ID: &'static str = "machine";
}

/// Platform security facts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityState {
    /// UEFI secure boot is enabled.
    pub secure_boot: bool,
    /// Kernel enforces module signatures.
    pub module_signature_enforced: bool,
    /// Kernel lockdown mode, e.g. `integrity`; empty if none.
    pub lockdown: String,
}
resource!(SecurityState, "SecurityStates.runtime.keel.dev", RUNTIME_NAMESPACE);

impl SecurityState {
    /// Singleton id.
    pub const ID: &'static str = "securitystate";
}

/// Bootloader entry the machine booted from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootedEntry {
    /// Entry identifier.
    pub entry: String,
}
resource!(BootedEntry, "BootedEntries.runtime.keel.dev", RUNTIME_NAMESPACE);

impl BootedEntry {
    /// Singleton id.
    pub const ID: &'static str = "bootedentry";
}

/// An installed system extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionStatus {
    /// Image the extension came from.
    pub image: String,
    /// Extension name.
    pub name: String,
    /// Extension version.
    pub version: String,
    /// Author.
    pub author: String,
    /// Description.
    pub description: String,
}
resource!(ExtensionStatus, "ExtensionStatuses.runtime.keel.dev", RUNTIME_NAMESPACE);

/// A package from a software bill of materials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SBOMItem {
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: String,
    /// Declared license.
    pub license: String,
    /// CPE identifiers.
    pub cpes: Vec<String>,
    /// Package URLs.
    pub purls: Vec<String>,
    /// Whether it belongs to an extension.
    pub extension: bool,
}
resource!(SBOMItem, "SBOMItems.runtime.keel.dev", RUNTIME_NAMESPACE);

/// A process killed by the OOM handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OOMProcess {
    /// Process id.
    pub pid: i32,
    /// Command line, arguments joined by spaces.
    pub cmdline: String,
}

/// One OOM handler action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OOMAction {
    /// JSON-encoded trigger evaluation context.
    pub trigger_context: String,
    /// Score of the killed cgroup.
    pub score: f64,
    /// Cgroup that was killed.
    pub cgroup: String,
    /// Killed processes.
    pub processes: Vec<OOMProcess>,
}
resource!(OOMAction, "OOMActions.runtime.keel.dev", RUNTIME_NAMESPACE);

/// A condition worth surfacing to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Short message.
    pub message: String,
    /// Details, one per line.
    pub details: Vec<String>,
}
resource!(Diagnostic, "Diagnostics.runtime.keel.dev", RUNTIME_NAMESPACE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_lookup() {
        let cmdline = KernelCmdline {
            cmdline: "console=ttyS0 keel.logging.kernel=tcp://a:1 quiet keel.logging.kernel=udp://b:2".into(),
        };
        assert_eq!(cmdline.get("keel.logging.kernel"), Some("udp://b:2"));
        assert_eq!(cmdline.get_all("keel.logging.kernel"), vec!["tcp://a:1", "udp://b:2"]);
        assert_eq!(cmdline.get("keel.events.sink"), None);
    }
}
