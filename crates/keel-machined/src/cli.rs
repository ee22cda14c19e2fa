//! Command line flags; each one overrides the matching config file field.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{DaemonConfig, LogFormat};

/// Keel machine daemon.
#[derive(Debug, Parser)]
#[command(name = "keel-machined", version, about = "Keel machine daemon", long_about = None)]
pub struct Cli {
    /// Daemon configuration file (`.toml` or `.json`).
    #[arg(short, long, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Prefix for every host path.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// procfs mount.
    #[arg(long)]
    pub proc: Option<PathBuf>,

    /// cgroup v2 mount.
    #[arg(long)]
    pub cgroup_root: Option<PathBuf>,

    /// Seccomp profile directory.
    #[arg(long)]
    pub seccomp_dir: Option<PathBuf>,

    /// Extension service config directory.
    #[arg(long)]
    pub extension_config_dir: Option<PathBuf>,

    /// Skip host-only side effects.
    #[arg(long)]
    pub container_mode: bool,

    /// Machine configuration document (YAML or JSON).
    #[arg(short, long)]
    pub machine_config: Option<PathBuf>,

    /// Retained events in the machine event stream.
    #[arg(long)]
    pub event_buffer: Option<usize>,

    /// Controller restart delay cap, e.g. `30s`.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub max_backoff: Option<std::time::Duration>,
}

impl Cli {
    /// Loads the config file, if any, and applies the flags on top.
    pub fn load(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Overrides `config` with the flags that were given.
    pub fn apply(&self, config: &mut DaemonConfig) {
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if let Some(root) = &self.root {
            config.root = Some(root.clone());
        }
        if let Some(p) = &self.proc {
            config.paths.proc = Some(p.clone());
        }
        if let Some(p) = &self.cgroup_root {
            config.paths.cgroup_root = Some(p.clone());
        }
        if let Some(p) = &self.seccomp_dir {
            config.paths.seccomp_dir = Some(p.clone());
        }
        if let Some(p) = &self.extension_config_dir {
            config.paths.extension_config_dir = Some(p.clone());
        }
        if self.container_mode {
            config.container_mode = true;
        }
        if let Some(p) = &self.machine_config {
            config.machine_config = Some(p.clone());
        }
        if let Some(n) = self.event_buffer {
            config.event_buffer = n;
        }
        if let Some(max) = self.max_backoff {
            config.backoff.max = max;
        }
    }
}
