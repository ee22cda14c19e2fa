//! Kernel module loading and the `/proc/modules` snapshot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use keel_resources::runtime::{KernelModuleSpec, KernelModuleStatus, LoadedKernelModule};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::sys::modules::{parse_proc_modules, KernelModules};

/// How often `/proc/modules` is re-read; inotify doesn't see procfs writes.
pub const MODULES_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Loads modules named by [`KernelModuleSpec`]s. Modules are never unloaded.
#[derive(Debug)]
pub struct KernelModuleSpecController {
    modules: KernelModules,
    loaded: HashMap<String, Vec<String>>,
}

impl KernelModuleSpecController {
    /// Controller loading from `modules`.
    pub fn new(modules: KernelModules) -> Self {
        KernelModuleSpecController {
            modules,
            loaded: HashMap::new(),
        }
    }

    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let specs = r.list::<KernelModuleSpec>()?;

        r.start_tracking_outputs();

        for spec in specs {
            let name = if spec.spec.name.is_empty() {
                spec.id().to_string()
            } else {
                spec.spec.name.clone()
            };

            if !self.loaded.contains_key(&name) {
                let order = self
                    .modules
                    .load(&name, &spec.spec.parameters)
                    .with_context(|| format!("loading module {name}"))?;
                info!(module = %name, ?order, "kernel module loaded");
                self.loaded.insert(name.clone(), order);
            }

            let loaded = self.loaded.get(&name).cloned().unwrap_or_default();
            r.modify::<KernelModuleStatus, _>(spec.id(), |status| {
                status.name = name;
                status.loaded = loaded;
                Ok(())
            })?;
        }

        r.cleanup_outputs::<KernelModuleStatus>()
    }
}

#[async_trait]
impl Controller for KernelModuleSpecController {
    fn name(&self) -> &str {
        "runtime.KernelModuleSpecController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<KernelModuleSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KernelModuleStatus>()]
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

/// Mirrors `/proc/modules` into [`LoadedKernelModule`] resources.
#[derive(Debug)]
pub struct LoadedKernelModuleController {
    path: PathBuf,
    last_hash: Option<[u8; 32]>,
}

impl LoadedKernelModuleController {
    /// Polls `<proc>/modules`.
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        LoadedKernelModuleController {
            path: proc_root.into().join("modules"),
            last_hash: None,
        }
    }

    /// Re-reads the file; reconciles only if its content hash changed.
    ///
    /// Returns whether a reconcile happened.
    pub fn poll(&mut self, r: &mut ControllerRuntime) -> ControllerResult<bool> {
        let content =
            std::fs::read_to_string(&self.path).with_context(|| format!("reading {}", self.path.display()))?;
        let hash: [u8; 32] = Sha256::digest(content.as_bytes()).into();

        if self.last_hash == Some(hash) {
            return Ok(false);
        }

        r.start_tracking_outputs();

        for (name, module) in parse_proc_modules(&content) {
            r.modify::<LoadedKernelModule, _>(&name, |m| {
                *m = module;
                Ok(())
            })?;
        }

        r.cleanup_outputs::<LoadedKernelModule>()?;
        self.last_hash = Some(hash);

        Ok(true)
    }
}

#[async_trait]
impl Controller for LoadedKernelModuleController {
    fn name(&self) -> &str {
        "runtime.LoadedKernelModuleController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<LoadedKernelModule>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let mut ticker = tokio::time::interval(MODULES_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            self.poll(r)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;
    use std::sync::Arc;

    use crate::sys::modules::ModuleLoader;
    use crate::testutil::{put, standalone};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingLoader {
        calls: Mutex<Vec<PathBuf>>,
    }

    impl ModuleLoader for CountingLoader {
        fn load(&self, path: &Path, _params: &str) -> io::Result<()> {
            self.calls.lock().push(path.to_path_buf());
            Ok(())
        }
    }

    #[test]
    fn test_module_loaded_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("modules.dep"),
            "kernel/drivers/net/wireguard/wireguard.ko: kernel/lib/crypto/libchacha.ko\nkernel/lib/crypto/libchacha.ko:\n",
        )
        .unwrap();
        let loader = Arc::new(CountingLoader::default());

        let (store, mut r) = standalone::<KernelModuleStatus>("runtime.KernelModuleSpecController");
        let mut ctrl = KernelModuleSpecController::new(KernelModules::new(dir.path(), loader.clone()));

        put(&store, "wireguard", KernelModuleSpec { name: "wireguard".into(), parameters: vec![] });
        ctrl.reconcile(&mut r).unwrap();
        ctrl.reconcile(&mut r).unwrap();

        assert_eq!(loader.calls.lock().len(), 2);
        let status = store.get_typed::<KernelModuleStatus>("wireguard").unwrap();
        assert_eq!(status.spec.loaded, vec!["libchacha", "wireguard"]);
    }

    #[test]
    fn test_unknown_module_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("modules.dep"), "").unwrap();

        let (store, mut r) = standalone::<KernelModuleStatus>("runtime.KernelModuleSpecController");
        let mut ctrl = KernelModuleSpecController::new(KernelModules::new(dir.path(), Arc::new(CountingLoader::default())));

        put(&store, "nope", KernelModuleSpec { name: "nope".into(), parameters: vec![] });
        assert!(ctrl.reconcile(&mut r).is_err());
    }

    #[test]
    fn test_poll_skips_unchanged_content() {
        let dir = tempfile::tempdir().unwrap();
        let modules = dir.path().join("modules");
        std::fs::write(&modules, "xfs 1888256 1 - Live 0x0\nvirtio_net 65536 0 - Live 0x0\n").unwrap();

        let (store, mut r) = standalone::<LoadedKernelModule>("runtime.LoadedKernelModuleController");
        let mut ctrl = LoadedKernelModuleController::new(dir.path());

        assert!(ctrl.poll(&mut r).unwrap());
        let version = store.get_typed::<LoadedKernelModule>("xfs").unwrap().metadata.version();
        assert!(!ctrl.poll(&mut r).unwrap());
        assert_eq!(store.get_typed::<LoadedKernelModule>("xfs").unwrap().metadata.version(), version);

        std::fs::write(&modules, "xfs 1888256 2 - Live 0x0\n").unwrap();
        assert!(ctrl.poll(&mut r).unwrap());
        assert_eq!(store.get_typed::<LoadedKernelModule>("xfs").unwrap().spec.reference_count, 2);
        assert!(store.get_typed::<LoadedKernelModule>("virtio_net").is_err());
    }
}
