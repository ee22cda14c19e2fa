//! Machine configuration document model.
//!
//! A document is decoded from YAML or JSON and seeded into the store as a
//! [`MachineConfig`](crate::config::MachineConfig). Projection controllers
//! read the sections below; unknown fields are ignored.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use keel_expr::Expression;
use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, Result};

/// Machine role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    /// Not yet known.
    #[default]
    Unknown,
    /// First control plane node.
    Init,
    /// Control plane node.
    Controlplane,
    /// Worker node.
    Worker,
}

impl MachineKind {
    /// Whether the machine runs control plane services.
    pub fn is_control_plane(&self) -> bool {
        matches!(self, MachineKind::Init | MachineKind::Controlplane)
    }
}

/// Root of the machine configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineConfigDocument {
    /// Document version, e.g. `v1alpha1`.
    pub version: String,
    /// Machine section.
    pub machine: MachineSection,
}

/// The `machine` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineSection {
    /// Machine role.
    #[serde(rename = "type")]
    pub kind: MachineKind,
    /// Kernel settings.
    pub kernel: KernelSection,
    /// Sysctl overrides keyed by dotted name.
    pub sysctls: BTreeMap<String, String>,
    /// Sysfs overrides keyed by dotted path.
    pub sysfs: BTreeMap<String, String>,
    /// Image registry settings.
    pub registries: RegistriesSection,
    /// Feature flags.
    pub features: FeaturesSection,
    /// Seccomp profiles.
    pub seccomp_profiles: Vec<SeccompProfileDoc>,
    /// Hardware watchdog.
    pub watchdog: Option<WatchdogDoc>,
    /// Periodic filesystem scrubs.
    pub fs_scrub: Vec<FsScrubDoc>,
    /// Event sink endpoint.
    pub event_sink: Option<EventSinkDoc>,
    /// Kernel log destinations.
    pub kmsg_log: Vec<KmsgLogDoc>,
    /// Extension service configuration files.
    pub extension_services: Vec<ExtensionServiceDoc>,
    /// OOM handler tuning.
    pub oom: Option<OomDoc>,
    /// Maintenance API tuning.
    pub maintenance: Option<MaintenanceDoc>,
}

/// Kernel settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelSection {
    /// Modules to load.
    pub modules: Vec<KernelModuleDoc>,
}

/// A kernel module to load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelModuleDoc {
    /// Module name.
    pub name: String,
    /// Module parameters, `key=value`.
    pub parameters: Vec<String>,
}

/// Registry mirrors and per-registry settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistriesSection {
    /// Mirrors keyed by registry host; `*` is the fallback for any registry.
    pub mirrors: BTreeMap<String, RegistryMirrorDoc>,
    /// TLS and auth keyed by registry endpoint host.
    pub config: BTreeMap<String, RegistryConfigDoc>,
}

/// Mirror endpoints for a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryMirrorDoc {
    /// Endpoint URLs, tried in order.
    pub endpoints: Vec<String>,
    /// Use the endpoint path as-is.
    pub override_path: bool,
    /// Do not fall back to the upstream registry.
    pub skip_fallback: bool,
}

/// TLS and auth for a registry endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfigDoc {
    /// TLS settings.
    pub tls: RegistryTlsDoc,
    /// Credentials.
    pub auth: RegistryAuthDoc,
}

/// Registry TLS settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryTlsDoc {
    /// Skip server certificate verification.
    pub insecure_skip_verify: bool,
    /// PEM-encoded CA bundle.
    pub ca: String,
    /// PEM-encoded client certificate.
    pub client_cert: String,
    /// PEM-encoded client key.
    pub client_key: String,
}

/// Registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryAuthDoc {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Pre-encoded auth string.
    pub auth: String,
    /// Identity token.
    pub identity_token: String,
}

/// Feature flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeaturesSection {
    /// Local image cache.
    pub image_cache: ImageCacheFeature,
}

/// Image cache feature settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageCacheFeature {
    /// Serve images from the local cache.
    pub local_enabled: bool,
    /// Listen address of the local registry.
    pub registry_address: String,
}

impl Default for ImageCacheFeature {
    fn default() -> Self {
        Self {
            local_enabled: false,
            registry_address: "127.0.0.1:65000".to_string(),
        }
    }
}

/// A named seccomp profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeccompProfileDoc {
    /// File name under the seccomp profile directory.
    pub name: String,
    /// Profile body.
    pub value: serde_json::Value,
}

/// Hardware watchdog settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogDoc {
    /// Character device path.
    pub device: String,
    /// Reboot timeout.
    #[serde(with = "crate::duration")]
    pub timeout: Duration,
}

impl Default for WatchdogDoc {
    fn default() -> Self {
        Self {
            device: "/dev/watchdog0".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// A periodic filesystem scrub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FsScrubDoc {
    /// Scrub name.
    pub name: String,
    /// Mount point of the filesystem.
    pub mountpoint: String,
    /// Interval between runs.
    #[serde(with = "crate::duration")]
    pub period: Duration,
}

impl Default for FsScrubDoc {
    fn default() -> Self {
        Self {
            name: String::new(),
            mountpoint: String::new(),
            period: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Event sink destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSinkDoc {
    /// `host:port` of the gRPC sink.
    pub endpoint: String,
}

/// A kernel log destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KmsgLogDoc {
    /// Destination name.
    pub name: String,
    /// `tcp://host:port` or `udp://host:port`.
    pub url: String,
}

/// Configuration files of one extension service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtensionServiceDoc {
    /// Extension service name.
    pub name: String,
    /// Files rendered for the service.
    pub config_files: Vec<ExtensionConfigFileDoc>,
    /// Environment, `KEY=value`.
    pub environment: Vec<String>,
}

/// A file rendered for an extension service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtensionConfigFileDoc {
    /// File content.
    pub content: String,
    /// Path the file is mounted at inside the service.
    pub mount_path: String,
}

/// OOM handler tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OomDoc {
    /// Boolean trigger expression.
    pub trigger_expression: Option<Expression>,
    /// Double cgroup ranking expression.
    pub cgroup_ranking_expression: Option<Expression>,
    /// Sampling interval.
    #[serde(with = "crate::duration::option")]
    pub sample_interval: Option<Duration>,
}

/// Maintenance API tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaintenanceDoc {
    /// Listen address, `host:port`.
    pub listen_address: Option<String>,
}

impl MachineConfigDocument {
    /// Decodes a YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Decodes a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Decodes bytes received over the API: JSON if it looks like JSON, YAML otherwise.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(raw);
        if text.trim_start().starts_with('{') {
            Self::from_json(&text)
        } else {
            Self::from_yaml(&text)
        }
    }

    /// Loads a document, choosing the decoder by file extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&contents),
            "json" => Self::from_json(&contents),
            _ => Err(ResourceError::UnsupportedFormat(ext.to_string())),
        }
    }
}
