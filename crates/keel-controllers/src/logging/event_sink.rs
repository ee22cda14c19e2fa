//! Forwards the machine event stream to a remote event sink.

use std::time::Duration;

use async_trait::async_trait;
use keel_api::proto::events::EventRequest;
use keel_api::{EventPayload, EventSinkClient};
use keel_resources::runtime::EventSinkConfig;
use keel_resources::services::NetworkStatus;
use keel_runtime::{
    Backoff, BackoffConfig, CancellationToken, Controller, ControllerResult, ControllerRuntime, Delivered, Drainer,
    EventStream, EventWatcher, Input, Output, ResultExt, TailOption,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Session {
    client: EventSinkClient,
    watcher: EventWatcher<EventPayload>,
}

/// Streams every retained and new event to the sink in [`EventSinkConfig`].
///
/// Resumes after the last acknowledged event on reconnect. On drain it stops
/// once the sink has acknowledged everything published so far, or right away
/// when no sink is connected.
pub struct EventsSinkController {
    events: EventStream<EventPayload>,
    drainer: Drainer,
    backoff: BackoffConfig,
    address_ready: bool,
}

impl std::fmt::Debug for EventsSinkController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsSinkController")
            .field("address_ready", &self.address_ready)
            .finish()
    }
}

impl EventsSinkController {
    /// Forwards `events`; registers with `drainer` while running.
    pub fn new(events: EventStream<EventPayload>, drainer: Drainer) -> Self {
        EventsSinkController {
            events,
            drainer,
            backoff: BackoffConfig {
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(10),
                ..Default::default()
            },
            address_ready: false,
        }
    }

    /// Sink endpoint to use now, if any.
    ///
    /// Nothing is sent before the node first gets an address.
    pub fn desired_endpoint(&mut self, r: &ControllerRuntime) -> ControllerResult<Option<String>> {
        if !self.address_ready {
            self.address_ready = r
                .get::<NetworkStatus>(NetworkStatus::ID)?
                .is_some_and(|status| status.spec.address_ready);
        }
        if !self.address_ready {
            return Ok(None);
        }

        Ok(r.get::<EventSinkConfig>(EventSinkConfig::ID)?
            .map(|cfg| cfg.spec.endpoint)
            .filter(|endpoint| !endpoint.is_empty()))
    }

    fn watch_from(&self, last_acked: Option<&str>) -> ControllerResult<EventWatcher<EventPayload>> {
        if let Some(id) = last_acked {
            match self.events.watch(TailOption::TailId(id.to_string())) {
                Ok(watcher) => return Ok(watcher),
                Err(err) => warn!(error = %err, "last acknowledged event is gone, replaying retained events"),
            }
        }
        self.events
            .watch(TailOption::TailEvents(-1))
            .context("watching machine events")
    }

    async fn open(&self, endpoint: &str, last_acked: Option<&str>) -> ControllerResult<Session> {
        let client = EventSinkClient::connect(endpoint)
            .await
            .with_context(|| format!("connecting to event sink {endpoint}"))?;
        Ok(Session {
            client,
            watcher: self.watch_from(last_acked)?,
        })
    }
}

fn to_request(delivered: &Delivered<EventPayload>) -> EventRequest {
    EventRequest {
        id: delivered.event.id.clone(),
        data: Some(delivered.event.payload.to_any()),
        actor_id: delivered.event.actor_id.clone(),
    }
}

async fn next_event(session: &mut Option<Session>) -> Option<Delivered<EventPayload>> {
    match session {
        Some(session) => session.watcher.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Controller for EventsSinkController {
    fn name(&self) -> &str {
        "runtime.EventsSinkController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<EventSinkConfig>().with_id(EventSinkConfig::ID),
            Input::weak::<NetworkStatus>().with_id(NetworkStatus::ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let mut drain = self.drainer.subscribe();
        let mut draining = false;
        let mut last_acked: Option<String> = None;

        let mut endpoint: Option<String> = None;
        let mut session: Option<Session> = None;
        let mut retry = Backoff::new(self.backoff.clone());
        let mut retry_at: Option<Instant> = None;

        loop {
            if session.is_none() && retry_at.is_none() {
                if let Some(target) = endpoint.clone() {
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(()),
                        res = self.open(&target, last_acked.as_deref()) => match res {
                            Ok(opened) => {
                                info!(endpoint = %target, "event sink connected");
                                session = Some(opened);
                                retry.reset();
                            }
                            Err(err) => {
                                let delay = retry.next_delay();
                                warn!(error = %err, ?delay, "event sink unavailable");
                                retry_at = Some(Instant::now() + delay);
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                    let desired = self.desired_endpoint(r)?;
                    if desired != endpoint {
                        debug!(?desired, "event sink destination changed");
                        endpoint = desired;
                        session = None;
                        retry_at = None;
                        retry.reset();
                    }
                }
                _ = drain.requested(), if !draining => {
                    if session.as_ref().map_or(0, |s| s.watcher.pending()) == 0 {
                        debug!("event sink drained");
                        return Ok(());
                    }
                    draining = true;
                }
                _ = sleep_until(retry_at), if retry_at.is_some() => {
                    retry_at = None;
                }
                delivered = next_event(&mut session), if session.is_some() => {
                    let Some(delivered) = delivered else {
                        return Ok(());
                    };
                    let Some(open) = session.as_mut() else {
                        continue;
                    };

                    let sent = tokio::select! {
                        _ = ctx.cancelled() => return Ok(()),
                        res = open.client.publish(to_request(&delivered)) => res,
                    };

                    match sent {
                        Ok(_) => {
                            last_acked = Some(delivered.event.id.clone());
                            if draining && open.watcher.pending() == 0 {
                                debug!("event sink drained");
                                return Ok(());
                            }
                        }
                        Err(status) => {
                            let delay = retry.next_delay();
                            warn!(error = %status, ?delay, "failed to publish event");
                            session = None;
                            retry_at = Some(Instant::now() + delay);
                        }
                    }
                }
            }

            r.reset_restart_backoff();
        }
    }
}
