#![warn(missing_docs)]

//! Keel machine daemon.
//!
//! Loads the daemon configuration, sets up logging, registers the controller
//! catalogue over a fresh store and runs it until a shutdown signal, draining
//! event and log delivery on the way out.

pub mod cli;
pub mod config;
pub mod daemon;

pub use cli::Cli;
pub use config::{DaemonConfig, LogFormat, LogSettings};
pub use daemon::{shutdown_signal, Daemon};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber; `RUST_LOG` wins over `log.level`.
pub fn init_tracing(log: &LogSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log.level))?;
    let registry = tracing_subscriber::registry().with(filter);

    match log.format {
        LogFormat::Text => registry.with(fmt::layer()).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }
    Ok(())
}
