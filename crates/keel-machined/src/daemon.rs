//! Store, runtime and controller catalogue wiring, plus orderly shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use keel_api::EventPayload;
use keel_controllers::logging::LogPersistence;
use keel_controllers::Catalogue;
use keel_resources::config::MachineConfig;
use keel_runtime::{CancellationToken, DrainState, Drainer, EventStream, Runtime};
use keel_state::{Resource, Store};
use tracing::{info, warn};

use crate::config::{load_machine_config, DaemonConfig};

/// A configured daemon, ready to run.
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<Store>,
    events: EventStream<EventPayload>,
    drainer: Drainer,
    runtime: Runtime,
    logs: LogPersistence,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").field("config", &self.config).finish()
    }
}

impl Daemon {
    /// Builds the store, registers every controller and seeds the machine
    /// configuration.
    pub fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = Store::new();
        keel_resources::register_all(&store);
        let store = Arc::new(store);

        let events = EventStream::new(config.event_buffer);
        let drainer = Drainer::new();

        let mut runtime = Runtime::new(Arc::clone(&store)).with_backoff(config.backoff_config());
        let mut catalogue = Catalogue::new(config.system_paths(), events.clone(), drainer.clone());
        catalogue.container_mode = config.container_mode;
        let logs = catalogue
            .register(&mut runtime)
            .context("registering controllers")?;

        if let Some(path) = &config.machine_config {
            let doc = load_machine_config(path)?;
            store
                .create(Resource::new(MachineConfig::ACTIVE_ID, MachineConfig::new(doc)))
                .context("seeding machine config")?;
            info!(path = %path.display(), "machine config loaded");
        }

        Ok(Daemon {
            config,
            store,
            events,
            drainer,
            runtime,
            logs,
        })
    }

    /// The resource store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The machine event stream.
    pub fn events(&self) -> &EventStream<EventPayload> {
        &self.events
    }

    /// Writer for service log files.
    pub fn logs(&self) -> LogPersistence {
        self.logs.clone()
    }

    /// Runs until `shutdown` resolves, then drains delivery and stops.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(self.runtime.run(ctx.clone()));

        shutdown.await;
        info!("shutting down");

        match self.drainer.drain(self.config.drain_timeout).await {
            DrainState::Drained => info!("delivery drained"),
            state => warn!(?state, timeout = ?self.config.drain_timeout, "drain did not finish"),
        }

        ctx.cancel();
        handle.await.context("controller runtime panicked")??;
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
