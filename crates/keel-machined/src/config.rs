//! Daemon configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use keel_controllers::SystemPaths;
use keel_resources::document::MachineConfigDocument;
use keel_runtime::BackoffConfig;
use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Host path overrides on top of `root`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathOverrides {
    /// procfs mount.
    pub proc: Option<PathBuf>,
    /// Root for `proc.sys.*` and `sys.*` parameter files.
    pub kernel_params_root: Option<PathBuf>,
    /// cgroup v2 mount.
    pub cgroup_root: Option<PathBuf>,
    /// Seccomp profile directory.
    pub seccomp_dir: Option<PathBuf>,
    /// Extension service config directory.
    pub extension_config_dir: Option<PathBuf>,
}

/// Controller restart backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    /// First restart delay.
    #[serde(with = "keel_resources::duration")]
    pub initial: Duration,
    /// Restart delay cap.
    #[serde(with = "keel_resources::duration")]
    pub max: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let d = BackoffConfig::default();
        BackoffSettings {
            initial: d.initial_backoff,
            max: d.max_backoff,
        }
    }
}

/// `keel-machined` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging.
    pub log: LogSettings,
    /// Prefix for every host path; `/` on a real machine.
    pub root: Option<PathBuf>,
    /// Individual path overrides.
    pub paths: PathOverrides,
    /// Running inside a container.
    pub container_mode: bool,
    /// Machine configuration document to load at startup.
    pub machine_config: Option<PathBuf>,
    /// Retained events in the machine event stream.
    pub event_buffer: usize,
    /// Controller restart backoff.
    pub backoff: BackoffSettings,
    /// Time allowed for event and log delivery to drain on shutdown.
    #[serde(with = "keel_resources::duration")]
    pub drain_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            log: LogSettings::default(),
            root: None,
            paths: PathOverrides::default(),
            container_mode: false,
            machine_config: None,
            event_buffer: 1000,
            backoff: BackoffSettings::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("unsupported config file extension: {ext}"),
        }
    }

    /// Host paths after applying `root` and the overrides.
    pub fn system_paths(&self) -> SystemPaths {
        let mut paths = match &self.root {
            Some(root) => SystemPaths::rooted(root),
            None => SystemPaths::default(),
        };

        let o = &self.paths;
        if let Some(p) = &o.proc {
            paths.proc = p.clone();
        }
        if let Some(p) = &o.kernel_params_root {
            paths.kernel_params_root = p.clone();
        }
        if let Some(p) = &o.cgroup_root {
            paths.cgroup_root = p.clone();
        }
        if let Some(p) = &o.seccomp_dir {
            paths.seccomp_dir = p.clone();
        }
        if let Some(p) = &o.extension_config_dir {
            paths.extension_config_dir = p.clone();
        }

        paths
    }

    /// Runtime restart backoff.
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_backoff: self.backoff.initial,
            max_backoff: self.backoff.max,
            ..Default::default()
        }
    }
}

/// Reads a machine configuration document, JSON by extension, YAML otherwise.
pub fn load_machine_config(path: &Path) -> anyhow::Result<MachineConfigDocument> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading machine config {}", path.display()))?;

    if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")) {
        return MachineConfigDocument::from_json(&raw).with_context(|| format!("parsing machine config {}", path.display()));
    }
    MachineConfigDocument::from_yaml(&raw).with_context(|| format!("parsing machine config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.event_buffer, 1000);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.system_paths(), SystemPaths::default());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
container_mode = true
drain_timeout = "5s"
root = "/tmp/machine"

[log]
format = "json"

[paths]
proc = "/host/proc"

[backoff]
max = "1m"
"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert!(config.container_mode);
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.backoff.max, Duration::from_secs(60));
        assert_eq!(config.backoff_config().max_backoff, Duration::from_secs(60));

        let paths = config.system_paths();
        assert_eq!(paths.proc, PathBuf::from("/host/proc"));
        assert_eq!(paths.cgroup_root, PathBuf::from("/tmp/machine/sys/fs/cgroup"));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"event_buffer": 50}}"#).unwrap();
        assert_eq!(DaemonConfig::from_file(file.path()).unwrap().event_buffer, 50);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::NamedTempFile::with_suffix(".ini").unwrap();
        assert!(DaemonConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_machine_config_yaml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "version: v1alpha1\nmachine:\n  sysctls:\n    vm.swappiness: \"10\"").unwrap();
        let doc = load_machine_config(file.path()).unwrap();
        assert_eq!(doc.machine.sysctls["vm.swappiness"], "10");
    }
}
