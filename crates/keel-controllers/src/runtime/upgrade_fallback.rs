use std::sync::Arc;

use async_trait::async_trait;
use keel_resources::runtime::{MachineStage, MachineStatus};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use tracing::info;

use crate::sys::meta::{MetaStore, UPGRADE_FALLBACK};

/// Drops the upgrade fallback meta key once the machine is running and ready.
///
/// Runs once per boot: it returns after the key is gone.
pub struct DropUpgradeFallbackController {
    meta: Arc<dyn MetaStore>,
}

impl std::fmt::Debug for DropUpgradeFallbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropUpgradeFallbackController").finish_non_exhaustive()
    }
}

impl DropUpgradeFallbackController {
    /// Controller over `meta`.
    pub fn new(meta: Arc<dyn MetaStore>) -> Self {
        DropUpgradeFallbackController { meta }
    }

    /// Deletes the key if the machine is up; returns whether it is done.
    pub fn reconcile(&mut self, r: &ControllerRuntime) -> ControllerResult<bool> {
        let up = r
            .get::<MachineStatus>(MachineStatus::ID)?
            .is_some_and(|ms| ms.spec.stage == MachineStage::Running && ms.spec.status.ready);
        if !up {
            return Ok(false);
        }

        if self.meta.delete(UPGRADE_FALLBACK).context("deleting upgrade fallback")? {
            info!("removed upgrade fallback");
        }
        Ok(true)
    }
}

#[async_trait]
impl Controller for DropUpgradeFallbackController {
    fn name(&self) -> &str {
        "runtime.DropUpgradeFallbackController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<MachineStatus>().with_id(MachineStatus::ID)]
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

            if self.reconcile(r)? {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_resources::runtime::MachineStatusStatus;

    use crate::sys::meta::FileMeta;
    use crate::testutil::{put, standalone_with};

    #[test]
    fn test_dropped_when_running_and_ready() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(FileMeta::new(dir.path()));
        meta.write(UPGRADE_FALLBACK, b"A").unwrap();

        let (store, r) = standalone_with("runtime.DropUpgradeFallbackController", vec![]);
        let mut ctrl = DropUpgradeFallbackController::new(meta.clone());
        assert!(!ctrl.reconcile(&r).unwrap());

        let mut ms = MachineStatus {
            stage: MachineStage::Running,
            status: MachineStatusStatus::default(),
        };
        put(store.as_ref(), MachineStatus::ID, ms.clone());
        assert!(!ctrl.reconcile(&r).unwrap());
        assert!(meta.read(UPGRADE_FALLBACK).unwrap().is_some());

        ms.status.ready = true;
        put(store.as_ref(), MachineStatus::ID, ms);
        assert!(ctrl.reconcile(&r).unwrap());
        assert!(meta.read(UPGRADE_FALLBACK).unwrap().is_none());
    }
}
