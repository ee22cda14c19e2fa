//! Keeps the container runtime shim binary bound from a sealed memfd copy.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use tracing::{error, info};

use crate::sys::memfd::MemfdBind;

/// A mount established over a path.
pub trait BoundMount: Send + Sync {
    /// Removes every mount stacked on the path.
    fn release(&self) -> io::Result<usize>;
}

/// Establishes a [`BoundMount`].
pub trait Rebinder: Send + Sync {
    /// Binds over `target`.
    fn bind(&self, target: &Path) -> io::Result<Box<dyn BoundMount>>;
}

impl BoundMount for MemfdBind {
    fn release(&self) -> io::Result<usize> {
        self.unmount_all()
    }
}

/// Binds a sealed memfd copy of the target over itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemfdRebinder;

impl Rebinder for MemfdRebinder {
    fn bind(&self, target: &Path) -> io::Result<Box<dyn BoundMount>> {
        Ok(Box::new(MemfdBind::clone_and_bind(target)?))
    }
}

/// Binds the runtime shim from memory for the lifetime of the process.
pub struct MemfdBindController {
    target: PathBuf,
    container_mode: bool,
    rebinder: Arc<dyn Rebinder>,
}

impl std::fmt::Debug for MemfdBindController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemfdBindController")
            .field("target", &self.target)
            .field("container_mode", &self.container_mode)
            .finish()
    }
}

impl MemfdBindController {
    /// Binds `target` unless running in a container.
    pub fn new(target: impl Into<PathBuf>, container_mode: bool, rebinder: Arc<dyn Rebinder>) -> Self {
        MemfdBindController {
            target: target.into(),
            container_mode,
            rebinder,
        }
    }
}

#[async_trait]
impl Controller for MemfdBindController {
    fn name(&self) -> &str {
        "runtime.MemfdBindController"
    }

    fn inputs(&self) -> Vec<Input> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn run(&mut self, ctx: &CancellationToken, _r: &mut ControllerRuntime) -> ControllerResult {
        if self.container_mode {
            return Ok(());
        }

        let bound = self
            .rebinder
            .bind(&self.target)
            .with_context(|| format!("binding memfd over {}", self.target.display()))?;
        info!(target = %self.target.display(), "bound from memfd");

        ctx.cancelled().await;

        match bound.release() {
            Ok(n) => info!(target = %self.target.display(), mounts = n, "memfd bind released"),
            Err(err) => error!(target = %self.target.display(), error = %err, "failed to release memfd bind"),
        }

        Ok(())
    }
}
