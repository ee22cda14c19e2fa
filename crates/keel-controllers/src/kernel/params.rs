//! Applies kernel parameters and restores them when their spec goes away.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;

use async_trait::async_trait;
use keel_resources::runtime::{KernelParamDefaultSpec, KernelParamSpec, KernelParamStatus};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use keel_state::{Phase, Pointer};
use tracing::{debug, info, warn};

use crate::sys::kernel_param::KernelParams;

const NAME: &str = "runtime.KernelParamSpecController";

struct Desired {
    value: String,
    ignore_errors: bool,
}

/// Writes [`KernelParamSpec`]s and hardening defaults to the kernel and
/// publishes [`KernelParamStatus`].
///
/// The value found before the first write of a key is cached and written
/// back once no spec wants the key any more.
#[derive(Debug)]
pub struct KernelParamSpecController {
    params: KernelParams,
    prior: HashMap<String, Option<String>>,
}

impl KernelParamSpecController {
    /// Controller over parameters rooted at `params`.
    pub fn new(params: KernelParams) -> Self {
        KernelParamSpecController {
            params,
            prior: HashMap::new(),
        }
    }

    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let mut desired: BTreeMap<String, Desired> = BTreeMap::new();
        let mut holds: Vec<Pointer> = Vec::new();
        let mut releases: Vec<Pointer> = Vec::new();

        for default in r.list::<KernelParamDefaultSpec>()? {
            if default.metadata.phase() == Phase::TearingDown {
                releases.push(default.metadata.pointer().clone());
                continue;
            }

            holds.push(default.metadata.pointer().clone());
            desired.insert(
                default.id().to_string(),
                Desired {
                    value: default.spec.value,
                    ignore_errors: default.spec.ignore_errors,
                },
            );
        }

        for spec in r.list::<KernelParamSpec>()? {
            if spec.metadata.phase() == Phase::TearingDown {
                releases.push(spec.metadata.pointer().clone());
                continue;
            }

            holds.push(spec.metadata.pointer().clone());
            let key = spec.id().to_string();
            if let Some(default) = desired.get(&key) {
                if default.value != spec.spec.value {
                    warn!(key = %key, default = %default.value, value = %spec.spec.value, "overriding hardening default");
                }
            }

            desired.insert(
                key,
                Desired {
                    value: spec.spec.value,
                    ignore_errors: spec.spec.ignore_errors,
                },
            );
        }

        for ptr in &holds {
            r.add_finalizer(ptr, NAME)?;
        }

        r.start_tracking_outputs();

        for (key, want) in &desired {
            if !self.prior.contains_key(key) {
                let prior = self.params.read(key).with_context(|| format!("reading {key}"))?;
                self.prior.insert(key.clone(), prior);
            }
            let default = self.prior.get(key).cloned().flatten().unwrap_or_default();

            let unsupported = match self.params.write(key, &want.value) {
                Ok(()) => false,
                Err(err) if err.kind() == io::ErrorKind::NotFound && want.ignore_errors => {
                    debug!(key = %key, "parameter not supported by the kernel");
                    true
                }
                Err(err) => return Err(err).with_context(|| format!("writing {key}")),
            };

            r.modify::<KernelParamStatus, _>(key, |status| {
                status.current = if unsupported { String::new() } else { want.value.clone() };
                status.default = default;
                status.unsupported = unsupported;
                Ok(())
            })?;
        }

        // A key stays cached until its restore succeeds, and its specs keep
        // the finalizer so the next pass retries.
        let stale: Vec<String> = self.prior.keys().filter(|k| !desired.contains_key(*k)).cloned().collect();
        let mut failed: Option<(String, io::Error)> = None;
        let mut unrestored: HashSet<String> = HashSet::new();
        for key in stale {
            let prior = self.prior.get(&key).cloned().flatten();
            match self.params.restore(&key, prior.as_deref()) {
                Ok(()) => {
                    self.prior.remove(&key);
                    info!(key = %key, "kernel parameter restored");
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to restore kernel parameter");
                    unrestored.insert(key.clone());
                    failed.get_or_insert((key, err));
                }
            }
        }

        for ptr in releases.iter().filter(|ptr| !unrestored.contains(&ptr.id)) {
            r.remove_finalizer(ptr, NAME)?;
        }

        r.cleanup_outputs::<KernelParamStatus>()?;

        match failed {
            Some((key, err)) => Err(err).with_context(|| format!("restoring {key}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Controller for KernelParamSpecController {
    fn name(&self) -> &str {
        NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::strong::<KernelParamSpec>(),
            Input::strong::<KernelParamDefaultSpec>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KernelParamStatus>()]
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
    use std::fs;
    use std::path::Path;

    use crate::testutil::{put, standalone};
    use keel_state::Store;

    const FILE_MAX: &str = "proc.sys.fs.file-max";

    fn seed_param(root: &Path, key: &str, value: &str) {
        let params = KernelParams::new(root);
        let path = params.path(key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, value).unwrap();
    }

    fn retire<T: keel_state::ResourceType>(store: &Store, id: &str) -> Pointer {
        let ptr = Pointer::new(T::NAMESPACE, T::TYPE, id);
        store.teardown(&ptr, None).unwrap();
        ptr
    }

    #[test]
    fn test_apply_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        seed_param(dir.path(), FILE_MAX, "100000\n");

        let (store, mut r) = standalone::<KernelParamStatus>(NAME);
        let mut ctrl = KernelParamSpecController::new(KernelParams::new(dir.path()));

        put(&store, FILE_MAX, KernelParamSpec { value: "500000".into(), ignore_errors: false });
        ctrl.reconcile(&mut r).unwrap();

        let params = KernelParams::new(dir.path());
        assert_eq!(params.read(FILE_MAX).unwrap().as_deref(), Some("500000"));
        let status = store.get_typed::<KernelParamStatus>(FILE_MAX).unwrap();
        assert_eq!(status.spec.current, "500000");
        assert_eq!(status.spec.default, "100000");

        let ptr = retire::<KernelParamSpec>(&store, FILE_MAX);
        assert!(store.destroy(&ptr, None).is_err());

        ctrl.reconcile(&mut r).unwrap();

        assert_eq!(params.read(FILE_MAX).unwrap().as_deref(), Some("100000"));
        assert!(store.get_typed::<KernelParamStatus>(FILE_MAX).is_err());
        store.destroy(&ptr, None).unwrap();
    }

    #[test]
    fn test_user_spec_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        seed_param(dir.path(), "proc.sys.kernel.kptr_restrict", "0");

        let (store, mut r) = standalone::<KernelParamStatus>(NAME);
        let mut ctrl = KernelParamSpecController::new(KernelParams::new(dir.path()));

        put(&store, "proc.sys.kernel.kptr_restrict", KernelParamDefaultSpec { value: "1".into(), ignore_errors: false });
        put(&store, "proc.sys.kernel.kptr_restrict", KernelParamSpec { value: "2".into(), ignore_errors: false });
        ctrl.reconcile(&mut r).unwrap();

        let status = store.get_typed::<KernelParamStatus>("proc.sys.kernel.kptr_restrict").unwrap();
        assert_eq!(status.spec.current, "2");

        // Dropping the user spec falls back to the default, not the original value.
        retire::<KernelParamSpec>(&store, "proc.sys.kernel.kptr_restrict");
        ctrl.reconcile(&mut r).unwrap();
        let status = store.get_typed::<KernelParamStatus>("proc.sys.kernel.kptr_restrict").unwrap();
        assert_eq!(status.spec.current, "1");
        assert_eq!(status.spec.default, "0");
    }

    #[test]
    fn test_missing_param_with_ignore_errors_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut r) = standalone::<KernelParamStatus>(NAME);
        let mut ctrl = KernelParamSpecController::new(KernelParams::new(dir.path()));

        put(&store, "proc.sys.kernel.yama.ptrace_scope", KernelParamSpec { value: "1".into(), ignore_errors: true });
        ctrl.reconcile(&mut r).unwrap();

        let status = store.get_typed::<KernelParamStatus>("proc.sys.kernel.yama.ptrace_scope").unwrap();
        assert!(status.spec.unsupported);
    }

    #[test]
    fn test_missing_param_without_ignore_errors_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut r) = standalone::<KernelParamStatus>(NAME);
        let mut ctrl = KernelParamSpecController::new(KernelParams::new(dir.path()));

        put(&store, "proc.sys.vm.nonexistent", KernelParamSpec { value: "1".into(), ignore_errors: false });
        assert!(ctrl.reconcile(&mut r).is_err());
    }

    #[test]
    fn test_failed_restore_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        seed_param(dir.path(), FILE_MAX, "100000\n");

        let (store, mut r) = standalone::<KernelParamStatus>(NAME);
        let mut ctrl = KernelParamSpecController::new(KernelParams::new(dir.path()));
        let params = KernelParams::new(dir.path());

        put(&store, FILE_MAX, KernelParamSpec { value: "500000".into(), ignore_errors: false });
        ctrl.reconcile(&mut r).unwrap();
        let ptr = retire::<KernelParamSpec>(&store, FILE_MAX);

        // make the parameter unwritable
        let path = params.path(FILE_MAX);
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(ctrl.reconcile(&mut r).is_err());
        assert!(store.destroy(&ptr, None).is_err());

        fs::remove_dir(&path).unwrap();
        fs::write(&path, "500000\n").unwrap();

        ctrl.reconcile(&mut r).unwrap();
        assert_eq!(params.read(FILE_MAX).unwrap().as_deref(), Some("100000"));
        store.destroy(&ptr, None).unwrap();
    }
}
