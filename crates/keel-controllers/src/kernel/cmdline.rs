use std::path::PathBuf;

use async_trait::async_trait;
use keel_resources::runtime::KernelCmdline;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};

/// Publishes [`KernelCmdline`] from `/proc/cmdline`, once.
#[derive(Debug)]
pub struct KernelCmdlineController {
    path: PathBuf,
}

impl KernelCmdlineController {
    /// Reads the command line from `<proc>/cmdline`.
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        KernelCmdlineController {
            path: proc_root.into().join("cmdline"),
        }
    }

    /// Reads the file and publishes the resource.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let raw = std::fs::read_to_string(&self.path).with_context(|| format!("reading {}", self.path.display()))?;

        r.modify::<KernelCmdline, _>(KernelCmdline::ID, |cmdline| {
            cmdline.cmdline = raw.trim().to_string();
            Ok(())
        })
    }
}

#[async_trait]
impl Controller for KernelCmdlineController {
    fn name(&self) -> &str {
        "runtime.KernelCmdlineController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KernelCmdline>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            ev = r.event() => {
                if ev.is_none() {
                    return Ok(());
                }
            }
        }

        self.reconcile(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::standalone;

    #[test]
    fn test_cmdline_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cmdline"), "console=ttyS0 keel.events.sink=10.0.0.1:4000\n").unwrap();

        let (store, mut r) = standalone::<KernelCmdline>("runtime.KernelCmdlineController");
        KernelCmdlineController::new(dir.path()).reconcile(&mut r).unwrap();

        let cmdline = store.get_typed::<KernelCmdline>(KernelCmdline::ID).unwrap();
        assert_eq!(cmdline.spec.cmdline, "console=ttyS0 keel.events.sink=10.0.0.1:4000");
        assert_eq!(cmdline.spec.get("keel.events.sink"), Some("10.0.0.1:4000"));
    }
}
