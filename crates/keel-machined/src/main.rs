#![warn(missing_docs)]

//! Keel machine daemon entry point.

use clap::Parser;
use keel_machined::{init_tracing, shutdown_signal, Cli, Daemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load()?;
    init_tracing(&config.log)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "keel-machined starting");

    let daemon = Daemon::new(config)?;
    daemon.run(shutdown_signal()).await
}
