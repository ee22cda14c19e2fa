//! Seccomp profile files for the kubelet.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keel_resources::runtime::SeccompProfile;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use tracing::info;

/// Writes `<dir>/<name>` for every [`SeccompProfile`] and removes other files.
#[derive(Debug)]
pub struct SeccompProfileFileController {
    dir: PathBuf,
}

/// Writes `content` to `path` unless it already holds exactly that.
///
/// Returns whether the file was written.
pub(crate) fn write_if_changed(path: &Path, content: &[u8]) -> io::Result<bool> {
    match fs::read(path) {
        Ok(current) if current == content => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(true)
}

impl SeccompProfileFileController {
    /// Manages profiles under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SeccompProfileFileController { dir: dir.into() }
    }

    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))?;

        let mut wanted = HashSet::new();
        for profile in r.list::<SeccompProfile>()? {
            let name = profile.spec.name.clone();
            let body =
                serde_json::to_vec(&profile.spec.value).with_context(|| format!("encoding profile {name}"))?;

            if write_if_changed(&self.dir.join(&name), &body).with_context(|| format!("writing profile {name}"))? {
                info!(profile = %name, "seccomp profile written");
            }
            wanted.insert(name);
        }

        for entry in fs::read_dir(&self.dir).with_context(|| format!("listing {}", self.dir.display()))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !wanted.contains(&name) {
                fs::remove_file(entry.path()).with_context(|| format!("removing profile {name}"))?;
                info!(profile = %name, "seccomp profile removed");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for SeccompProfileFileController {
    fn name(&self) -> &str {
        "runtime.SeccompProfileFileController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<SeccompProfile>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![]
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
