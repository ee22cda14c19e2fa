//! Runtime specs: watchdog, filesystem scrubs, seccomp profiles, extension
//! service configuration and the maintenance service.

use std::time::Duration;

use async_trait::async_trait;
use keel_resources::runtime::{
    Diagnostic, ExtensionServiceConfigFile, ExtensionServicesConfig, FSScrubConfig, MaintenanceServiceConfig,
    SeccompProfile, WatchdogTimerConfig,
};
use keel_resources::services::NodeAddresses;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output};

use super::{active_machine_config, machine_config_input};

/// Default maintenance API listen address.
pub const DEFAULT_MAINTENANCE_LISTEN: &str = "[::]:50000";

/// Shortest accepted watchdog timeout.
pub const MIN_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(3);

/// Publishes [`WatchdogTimerConfig`].
///
/// A timeout below [`MIN_WATCHDOG_TIMEOUT`] or an empty device leaves the
/// watchdog unconfigured and is reported as a [`Diagnostic`].
#[derive(Debug, Default)]
pub struct WatchdogTimerConfigController;

impl WatchdogTimerConfigController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let watchdog = active_machine_config(r)?.and_then(|cfg| cfg.machine.watchdog.clone());

        r.start_tracking_outputs();

        if let Some(watchdog) = watchdog {
            if watchdog.device.is_empty() || watchdog.timeout < MIN_WATCHDOG_TIMEOUT {
                r.modify::<Diagnostic, _>("watchdog-config-invalid", |d| {
                    d.message = "watchdog timer configuration is invalid".to_string();
                    d.details = vec![format!(
                        "device {:?} with timeout {:?}: a device and a timeout of at least {:?} are required",
                        watchdog.device, watchdog.timeout, MIN_WATCHDOG_TIMEOUT
                    )];
                    Ok(())
                })?;
            } else {
                r.modify::<WatchdogTimerConfig, _>(WatchdogTimerConfig::ID, |cfg| {
                    cfg.device = watchdog.device;
                    cfg.timeout = watchdog.timeout;
                    Ok(())
                })?;
            }
        }

        r.cleanup_outputs::<WatchdogTimerConfig>()?;
        r.cleanup_outputs::<Diagnostic>()
    }
}

#[async_trait]
impl Controller for WatchdogTimerConfigController {
    fn name(&self) -> &str {
        "runtime.WatchdogTimerConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<WatchdogTimerConfig>(), Output::shared::<Diagnostic>()]
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

/// Publishes one [`FSScrubConfig`] per configured scrub.
#[derive(Debug, Default)]
pub struct FSScrubConfigController;

impl FSScrubConfigController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let scrubs = active_machine_config(r)?
            .map(|cfg| cfg.machine.fs_scrub.clone())
            .unwrap_or_default();

        r.start_tracking_outputs();

        let mut invalid = Vec::new();
        for scrub in scrubs {
            let id = if scrub.name.is_empty() {
                scrub.mountpoint.clone()
            } else {
                scrub.name.clone()
            };

            if scrub.mountpoint.is_empty() || scrub.period.is_zero() {
                invalid.push(format!("{id:?}: mountpoint and a non-zero period are required"));
                continue;
            }

            r.modify::<FSScrubConfig, _>(&id, |cfg| {
                cfg.name = id.clone();
                cfg.mountpoint = scrub.mountpoint;
                cfg.period = scrub.period;
                Ok(())
            })?;
        }

        if !invalid.is_empty() {
            r.modify::<Diagnostic, _>("fs-scrub-config-invalid", |d| {
                d.message = "filesystem scrub configuration is invalid".to_string();
                d.details = invalid;
                Ok(())
            })?;
        }

        r.cleanup_outputs::<FSScrubConfig>()?;
        r.cleanup_outputs::<Diagnostic>()
    }
}

#[async_trait]
impl Controller for FSScrubConfigController {
    fn name(&self) -> &str {
        "runtime.FSScrubConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<FSScrubConfig>(), Output::shared::<Diagnostic>()]
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

/// Publishes one [`SeccompProfile`] per configured profile.
#[derive(Debug, Default)]
pub struct SeccompProfileController;

impl SeccompProfileController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let profiles = active_machine_config(r)?
            .map(|cfg| cfg.machine.seccomp_profiles.clone())
            .unwrap_or_default();

        r.start_tracking_outputs();

        for profile in profiles {
            r.modify::<SeccompProfile, _>(&profile.name.clone(), |p| {
                p.name = profile.name;
                p.value = profile.value;
                Ok(())
            })?;
        }

        r.cleanup_outputs::<SeccompProfile>()
    }
}

#[async_trait]
impl Controller for SeccompProfileController {
    fn name(&self) -> &str {
        "runtime.SeccompProfileController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<SeccompProfile>()]
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

/// Publishes one [`ExtensionServicesConfig`] per configured extension.
#[derive(Debug, Default)]
pub struct ExtensionServicesConfigController;

impl ExtensionServicesConfigController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let extensions = active_machine_config(r)?
            .map(|cfg| cfg.machine.extension_services.clone())
            .unwrap_or_default();

        r.start_tracking_outputs();

        for ext in extensions {
            r.modify::<ExtensionServicesConfig, _>(&ext.name, |cfg| {
                cfg.files = ext
                    .config_files
                    .iter()
                    .map(|f| ExtensionServiceConfigFile {
                        content: f.content.clone(),
                        mount_path: f.mount_path.clone(),
                    })
                    .collect();
                cfg.environment = ext.environment.clone();
                Ok(())
            })?;
        }

        r.cleanup_outputs::<ExtensionServicesConfig>()
    }
}

#[async_trait]
impl Controller for ExtensionServicesConfigController {
    fn name(&self) -> &str {
        "runtime.ExtensionServicesConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<ExtensionServicesConfig>()]
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

/// Publishes [`MaintenanceServiceConfig`]: listen address and the addresses
/// the service can be reached on.
#[derive(Debug, Default)]
pub struct MaintenanceConfigController;

impl MaintenanceConfigController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let listen_address = active_machine_config(r)?
            .and_then(|cfg| cfg.machine.maintenance.as_ref().and_then(|m| m.listen_address.clone()))
            .unwrap_or_else(|| DEFAULT_MAINTENANCE_LISTEN.to_string());

        let reachable = r
            .get::<NodeAddresses>(NodeAddresses::CURRENT_ID)?
            .map(|a| a.spec.addresses)
            .unwrap_or_default();

        r.modify::<MaintenanceServiceConfig, _>(MaintenanceServiceConfig::ID, |cfg| {
            cfg.listen_address = listen_address;
            cfg.reachable_addresses = reachable;
            Ok(())
        })
    }
}

#[async_trait]
impl Controller for MaintenanceConfigController {
    fn name(&self) -> &str {
        "runtime.MaintenanceConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            machine_config_input(),
            Input::weak::<NodeAddresses>().with_id(NodeAddresses::CURRENT_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<MaintenanceServiceConfig>()]
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
