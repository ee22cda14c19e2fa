//! Kernel parameter and module specs from the machine configuration.

use async_trait::async_trait;
use keel_resources::runtime::{KernelModuleSpec, KernelParamDefaultSpec, KernelParamSpec};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output};

use super::{active_machine_config, machine_config_input};
use crate::sys::kernel_param::{sysctl_key, sysfs_key};

/// Hardening defaults: `(sysctl, value, ignore_errors)`.
pub const KSPP_DEFAULTS: &[(&str, &str, bool)] = &[
    ("kernel.kptr_restrict", "1", false),
    ("kernel.dmesg_restrict", "1", false),
    ("kernel.perf_event_paranoid", "3", false),
    ("kernel.yama.ptrace_scope", "1", true),
    ("kernel.unprivileged_bpf_disabled", "1", false),
    ("net.core.bpf_jit_harden", "2", true),
    ("dev.tty.ldisc_autoload", "0", true),
    ("fs.protected_fifos", "2", false),
    ("fs.protected_regular", "2", false),
    ("fs.protected_symlinks", "1", false),
    ("fs.protected_hardlinks", "1", false),
];

/// Projects `machine.sysctls` and `machine.sysfs` into [`KernelParamSpec`]s.
#[derive(Debug, Default)]
pub struct KernelParamConfigController;

impl KernelParamConfigController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let cfg = active_machine_config(r)?;

        r.start_tracking_outputs();

        if let Some(cfg) = cfg {
            let sysctls = cfg.machine.sysctls.iter().map(|(k, v)| (sysctl_key(k), v));
            let sysfs = cfg.machine.sysfs.iter().map(|(k, v)| (sysfs_key(k), v));

            for (key, value) in sysctls.chain(sysfs) {
                r.modify::<KernelParamSpec, _>(&key, |spec| {
                    spec.value = value.clone();
                    spec.ignore_errors = false;
                    Ok(())
                })?;
            }
        }

        r.cleanup_outputs::<KernelParamSpec>()
    }
}

#[async_trait]
impl Controller for KernelParamConfigController {
    fn name(&self) -> &str {
        "runtime.KernelParamConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KernelParamSpec>()]
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

/// Publishes the hardening defaults as [`KernelParamDefaultSpec`]s.
#[derive(Debug, Default)]
pub struct KernelParamDefaultsController;

impl KernelParamDefaultsController {
    /// Writes every default.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        r.start_tracking_outputs();

        for (name, value, ignore_errors) in KSPP_DEFAULTS {
            r.modify::<KernelParamDefaultSpec, _>(&sysctl_key(name), |spec| {
                spec.value = value.to_string();
                spec.ignore_errors = *ignore_errors;
                Ok(())
            })?;
        }

        r.cleanup_outputs::<KernelParamDefaultSpec>()
    }
}

#[async_trait]
impl Controller for KernelParamDefaultsController {
    fn name(&self) -> &str {
        "runtime.KernelParamDefaultsController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KernelParamDefaultSpec>()]
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

/// Projects `machine.kernel.modules` into [`KernelModuleSpec`]s.
#[derive(Debug, Default)]
pub struct KernelModuleConfigController;

impl KernelModuleConfigController {
    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let cfg = active_machine_config(r)?;

        r.start_tracking_outputs();

        if let Some(cfg) = cfg {
            for module in &cfg.machine.kernel.modules {
                r.modify::<KernelModuleSpec, _>(&module.name, |spec| {
                    spec.name = module.name.clone();
                    spec.parameters = module.parameters.clone();
                    Ok(())
                })?;
            }
        }

        r.cleanup_outputs::<KernelModuleSpec>()
    }
}

#[async_trait]
impl Controller for KernelModuleConfigController {
    fn name(&self) -> &str {
        "runtime.KernelModuleConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![machine_config_input()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KernelModuleSpec>()]
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
    use crate::testutil::{seed_config, standalone};
    use keel_resources::document::MachineConfigDocument;

    #[test]
    fn test_sysctls_and_sysfs_projected() {
        let mut doc = MachineConfigDocument::default();
        doc.machine.sysctls.insert("fs.file-max".into(), "500000".into());
        doc.machine.sysfs.insert("kernel.mm.ksm.run".into(), "1".into());

        let (store, mut r) = standalone::<KernelParamSpec>("runtime.KernelParamConfigController");
        seed_config(&store, doc);

        KernelParamConfigController.reconcile(&mut r).unwrap();

        let spec = store.get_typed::<KernelParamSpec>("proc.sys.fs.file-max").unwrap();
        assert_eq!(spec.spec.value, "500000");
        assert!(store.get_typed::<KernelParamSpec>("sys.kernel.mm.ksm.run").is_ok());
    }

    #[test]
    fn test_removed_sysctl_is_cleaned_up() {
        let mut doc = MachineConfigDocument::default();
        doc.machine.sysctls.insert("fs.file-max".into(), "500000".into());

        let (store, mut r) = standalone::<KernelParamSpec>("runtime.KernelParamConfigController");
        seed_config(&store, doc);
        KernelParamConfigController.reconcile(&mut r).unwrap();

        seed_config(&store, MachineConfigDocument::default());
        KernelParamConfigController.reconcile(&mut r).unwrap();

        assert!(store.get_typed::<KernelParamSpec>("proc.sys.fs.file-max").is_err());
    }

    #[test]
    fn test_defaults_published() {
        let (store, mut r) = standalone::<KernelParamDefaultSpec>("runtime.KernelParamDefaultsController");
        KernelParamDefaultsController.reconcile(&mut r).unwrap();

        let spec = store
            .get_typed::<KernelParamDefaultSpec>("proc.sys.kernel.kptr_restrict")
            .unwrap();
        assert_eq!(spec.spec.value, "1");
    }

    #[test]
    fn test_modules_projected() {
        let mut doc = MachineConfigDocument::default();
        doc.machine.kernel.modules.push(keel_resources::document::KernelModuleDoc {
            name: "br_netfilter".into(),
            parameters: vec!["foo=1".into()],
        });

        let (store, mut r) = standalone::<KernelModuleSpec>("runtime.KernelModuleConfigController");
        seed_config(&store, doc);
        KernelModuleConfigController.reconcile(&mut r).unwrap();

        let spec = store.get_typed::<KernelModuleSpec>("br_netfilter").unwrap();
        assert_eq!(spec.spec.parameters, vec!["foo=1"]);
    }
}
