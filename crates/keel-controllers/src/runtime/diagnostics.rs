//! Operator-facing diagnostics: periodic checks and their logger.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use keel_resources::runtime::{Diagnostic, FSScrubStatus, KernelParamStatus, OOMAction};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Upper bound on a single check.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// How often checks are re-run without input changes.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A condition evaluated against the store.
#[async_trait]
pub trait DiagnosticCheck: Send + Sync {
    /// Id of the diagnostic this check publishes.
    fn id(&self) -> &'static str;

    /// Returns the diagnostic if the condition holds.
    async fn check(&self, r: &ControllerRuntime) -> ControllerResult<Option<Diagnostic>>;
}

/// Kernel parameters the kernel doesn't know about.
#[derive(Debug, Default)]
pub struct UnsupportedKernelParams;

#[async_trait]
impl DiagnosticCheck for UnsupportedKernelParams {
    fn id(&self) -> &'static str {
        "kernel-params-unsupported"
    }

    async fn check(&self, r: &ControllerRuntime) -> ControllerResult<Option<Diagnostic>> {
        let details: Vec<String> = r
            .list::<KernelParamStatus>()?
            .into_iter()
            .filter(|s| s.spec.unsupported)
            .map(|s| s.id().to_string())
            .collect();

        Ok((!details.is_empty()).then(|| Diagnostic {
            message: "kernel parameters are not supported by the running kernel".to_string(),
            details,
        }))
    }
}

/// Filesystem scrubs whose last run failed.
#[derive(Debug, Default)]
pub struct FailedScrubs;

#[async_trait]
impl DiagnosticCheck for FailedScrubs {
    fn id(&self) -> &'static str {
        "fs-scrub-failed"
    }

    async fn check(&self, r: &ControllerRuntime) -> ControllerResult<Option<Diagnostic>> {
        let details: Vec<String> = r
            .list::<FSScrubStatus>()?
            .into_iter()
            .filter(|s| !matches!(s.spec.status.as_str(), "" | "scheduled" | "success"))
            .map(|s| format!("{}: {}", s.spec.mountpoint, s.spec.status))
            .collect();

        Ok((!details.is_empty()).then(|| Diagnostic {
            message: "filesystem scrub failed".to_string(),
            details,
        }))
    }
}

/// Cgroups killed by the OOM handler.
#[derive(Debug, Default)]
pub struct RecentOomKills;

#[async_trait]
impl DiagnosticCheck for RecentOomKills {
    fn id(&self) -> &'static str {
        "oom-kills"
    }

    async fn check(&self, r: &ControllerRuntime) -> ControllerResult<Option<Diagnostic>> {
        let details: Vec<String> = r.list::<OOMAction>()?.into_iter().map(|a| a.spec.cgroup).collect();

        Ok((!details.is_empty()).then(|| Diagnostic {
            message: format!("the OOM handler killed {} cgroup(s)", details.len()),
            details,
        }))
    }
}

/// The default check set.
pub fn default_checks() -> Vec<Box<dyn DiagnosticCheck>> {
    vec![Box::new(UnsupportedKernelParams), Box::new(FailedScrubs), Box::new(RecentOomKills)]
}

/// Runs [`DiagnosticCheck`]s and publishes a [`Diagnostic`] for each that holds.
pub struct DiagnosticsController {
    checks: Vec<Box<dyn DiagnosticCheck>>,
}

impl std::fmt::Debug for DiagnosticsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.checks.iter().map(|c| c.id()).collect();
        f.debug_struct("DiagnosticsController").field("checks", &ids).finish()
    }
}

impl DiagnosticsController {
    /// Controller running `checks`.
    pub fn new(checks: Vec<Box<dyn DiagnosticCheck>>) -> Self {
        DiagnosticsController { checks }
    }

    /// Runs every check once.
    pub async fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        r.start_tracking_outputs();

        for check in &self.checks {
            let found = match tokio::time::timeout(CHECK_TIMEOUT, check.check(r)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(check = check.id(), "diagnostic check timed out");
                    continue;
                }
            };

            if let Some(diag) = found {
                r.modify::<Diagnostic, _>(check.id(), |d| {
                    *d = diag;
                    Ok(())
                })?;
            }
        }

        r.cleanup_outputs::<Diagnostic>()
    }
}

#[async_trait]
impl Controller for DiagnosticsController {
    fn name(&self) -> &str {
        "runtime.DiagnosticsController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<KernelParamStatus>(),
            Input::weak::<FSScrubStatus>(),
            Input::weak::<OOMAction>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared::<Diagnostic>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {}
            }

            self.reconcile(r).await?;
        }
    }
}

/// Logs each diagnostic when it appears or changes, and when it goes away.
#[derive(Debug, Default)]
pub struct DiagnosticsLoggerController {
    seen: BTreeMap<String, Diagnostic>,
}

impl DiagnosticsLoggerController {
    /// Logs changes since the last pass; returns the ids logged as new or changed.
    pub fn reconcile(&mut self, r: &ControllerRuntime) -> ControllerResult<Vec<String>> {
        let current: BTreeMap<String, Diagnostic> = r
            .list::<Diagnostic>()?
            .into_iter()
            .map(|d| (d.id().to_string(), d.spec))
            .collect();

        let mut logged = Vec::new();
        for (id, diag) in &current {
            if self.seen.get(id) != Some(diag) {
                warn!(id = %id, details = ?diag.details, "{}", diag.message);
                logged.push(id.clone());
            }
        }

        for id in self.seen.keys().filter(|id| !current.contains_key(*id)) {
            info!(id = %id, "diagnostic resolved");
        }

        self.seen = current;
        Ok(logged)
    }
}

#[async_trait]
impl Controller for DiagnosticsLoggerController {
    fn name(&self) -> &str {
        "runtime.DiagnosticsLoggerController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<Diagnostic>()]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
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
