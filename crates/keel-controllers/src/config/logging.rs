//! Kernel log and event sink destinations.
//!
//! The machine configuration wins; the kernel command line is the fallback.

use async_trait::async_trait;
use keel_resources::runtime::{Diagnostic, EventSinkConfig, KernelCmdline, KmsgLogConfig};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output};
use tracing::warn;

use super::{active_machine_config, machine_config_input};

/// Kernel command line flag carrying kernel log destinations.
pub const KMSG_CMDLINE_FLAG: &str = "keel.logging.kernel";

/// Kernel command line flag carrying the event sink endpoint.
pub const EVENT_SINK_CMDLINE_FLAG: &str = "keel.events.sink";

const KMSG_DIAGNOSTIC_ID: &str = "kmsg-log-destination-invalid";

/// Checks a kernel log destination URL: `tcp://host:port` or `udp://host:port`.
pub fn validate_kmsg_url(url: &str) -> Result<(), String> {
    let uri: http::Uri = url.parse().map_err(|e| format!("{url}: {e}"))?;

    match uri.scheme_str() {
        Some("tcp") | Some("udp") => {}
        other => return Err(format!("{url}: unsupported scheme {other:?}")),
    }

    if uri.host().is_none() || uri.port_u16().is_none() {
        return Err(format!("{url}: host and port are required"));
    }

    Ok(())
}

/// Publishes [`KmsgLogConfig`].
#[derive(Debug, Default)]
pub struct KmsgLogConfigController;

impl KmsgLogConfigController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let mut urls: Vec<String> = active_machine_config(r)?
            .map(|cfg| cfg.machine.kmsg_log.iter().map(|d| d.url.clone()).collect())
            .unwrap_or_default();

        if urls.is_empty() {
            if let Some(cmdline) = r.get::<KernelCmdline>(KernelCmdline::ID)? {
                urls = cmdline
                    .spec
                    .get_all(KMSG_CMDLINE_FLAG)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
            }
        }

        let mut destinations = Vec::new();
        let mut invalid = Vec::new();
        for url in urls {
            match validate_kmsg_url(&url) {
                Ok(()) => destinations.push(url),
                Err(reason) => {
                    warn!(%reason, "ignoring kernel log destination");
                    invalid.push(reason);
                }
            }
        }

        r.start_tracking_outputs();

        if !destinations.is_empty() {
            r.modify::<KmsgLogConfig, _>(KmsgLogConfig::ID, |cfg| {
                cfg.destinations = destinations;
                Ok(())
            })?;
        }

        if !invalid.is_empty() {
            r.modify::<Diagnostic, _>(KMSG_DIAGNOSTIC_ID, |d| {
                d.message = "kernel log destinations are invalid".to_string();
                d.details = invalid;
                Ok(())
            })?;
        }

        r.cleanup_outputs::<KmsgLogConfig>()?;
        r.cleanup_outputs::<Diagnostic>()
    }
}

#[async_trait]
impl Controller for KmsgLogConfigController {
    fn name(&self) -> &str {
        "runtime.KmsgLogConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input(), Input::weak::<KernelCmdline>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KmsgLogConfig>(), Output::shared::<Diagnostic>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                }
            }

            self.reconcile(r)?;
        }
    }
}

/// Publishes [`EventSinkConfig`].
#[derive(Debug, Default)]
pub struct EventSinkConfigController;

impl EventSinkConfigController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let mut endpoint = active_machine_config(r)?
            .and_then(|cfg| cfg.machine.event_sink.as_ref().map(|s| s.endpoint.clone()))
            .unwrap_or_default();

        if endpoint.is_empty() {
            if let Some(cmdline) = r.get::<KernelCmdline>(KernelCmdline::ID)? {
                endpoint = cmdline.spec.get(EVENT_SINK_CMDLINE_FLAG).unwrap_or_default().to_string();
            }
        }

        r.start_tracking_outputs();

        if !endpoint.is_empty() {
            r.modify::<EventSinkConfig, _>(EventSinkConfig::ID, |cfg| {
                cfg.endpoint = endpoint;
                Ok(())
            })?;
        }

        r.cleanup_outputs::<EventSinkConfig>()
    }
}

#[async_trait]
impl Controller for EventSinkConfigController {
    fn name(&self) -> &str {
        "runtime.EventSinkConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input(), Input::weak::<KernelCmdline>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<EventSinkConfig>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                }
            }

            self.reconcile(r)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{put, seed_config, standalone_with};
    use keel_resources::document::{EventSinkDoc, KmsgLogDoc, MachineConfigDocument};

    #[test]
    fn test_validate_kmsg_url() {
        assert!(validate_kmsg_url("tcp://10.0.0.1:5170").is_ok());
        assert!(validate_kmsg_url("udp://logs.example:514").is_ok());
        assert!(validate_kmsg_url("http://logs.example:514").is_err());
        assert!(validate_kmsg_url("tcp://logs.example").is_err());
    }

    #[test]
    fn test_kmsg_from_cmdline_with_diagnostic() {
        let (store, mut r) = standalone_with(
            "runtime.KmsgLogConfigController",
            vec![Output::exclusive::<KmsgLogConfig>(), Output::shared::<Diagnostic>()],
        );
        put(
            &store,
            KernelCmdline::ID,
            KernelCmdline {
                cmdline: "keel.logging.kernel=tcp://10.0.0.1:5170 keel.logging.kernel=ftp://x:1".into(),
            },
        );

        KmsgLogConfigController.reconcile(&mut r).unwrap();

        let cfg = store.get_typed::<KmsgLogConfig>(KmsgLogConfig::ID).unwrap();
        assert_eq!(cfg.spec.destinations, vec!["tcp://10.0.0.1:5170"]);
        let diag = store.get_typed::<Diagnostic>(KMSG_DIAGNOSTIC_ID).unwrap();
        assert_eq!(diag.spec.details.len(), 1);
    }

    #[test]
    fn test_kmsg_config_wins_over_cmdline() {
        let (store, mut r) = standalone_with(
            "runtime.KmsgLogConfigController",
            vec![Output::exclusive::<KmsgLogConfig>(), Output::shared::<Diagnostic>()],
        );
        put(
            &store,
            KernelCmdline::ID,
            KernelCmdline {
                cmdline: "keel.logging.kernel=tcp://10.0.0.1:5170".into(),
            },
        );
        let mut doc = MachineConfigDocument::default();
        doc.machine.kmsg_log.push(KmsgLogDoc {
            name: "remote".into(),
            url: "udp://10.0.0.2:514".into(),
        });
        seed_config(&store, doc);

        KmsgLogConfigController.reconcile(&mut r).unwrap();

        let cfg = store.get_typed::<KmsgLogConfig>(KmsgLogConfig::ID).unwrap();
        assert_eq!(cfg.spec.destinations, vec!["udp://10.0.0.2:514"]);
        assert!(store.get_typed::<Diagnostic>(KMSG_DIAGNOSTIC_ID).is_err());
    }

    #[test]
    fn test_event_sink_endpoint() {
        let (store, mut r) = standalone_with(
            "runtime.EventSinkConfigController",
            vec![Output::exclusive::<EventSinkConfig>()],
        );

        EventSinkConfigController.reconcile(&mut r).unwrap();
        assert!(store.get_typed::<EventSinkConfig>(EventSinkConfig::ID).is_err());

        put(
            &store,
            KernelCmdline::ID,
            KernelCmdline {
                cmdline: "keel.events.sink=10.5.0.1:4002".into(),
            },
        );
        EventSinkConfigController.reconcile(&mut r).unwrap();
        assert_eq!(
            store.get_typed::<EventSinkConfig>(EventSinkConfig::ID).unwrap().spec.endpoint,
            "10.5.0.1:4002"
        );

        let mut doc = MachineConfigDocument::default();
        doc.machine.event_sink = Some(EventSinkDoc {
            endpoint: "10.5.0.9:4002".into(),
        });
        seed_config(&store, doc);
        EventSinkConfigController.reconcile(&mut r).unwrap();
        assert_eq!(
            store.get_typed::<EventSinkConfig>(EventSinkConfig::ID).unwrap().spec.endpoint,
            "10.5.0.9:4002"
        );
    }
}
