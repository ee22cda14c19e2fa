//! Configuration files of extension services.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use keel_resources::runtime::ExtensionServicesConfig;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use tracing::info;

use super::seccomp::write_if_changed;

/// File name of a config file mounted at `mount_path`: `/etc/test` is `etc-test`.
pub fn config_file_name(mount_path: &str) -> String {
    mount_path.trim_start_matches('/').replace('/', "-")
}

/// Renders [`ExtensionServicesConfig`] files to `<dir>/<extension>/<file>`
/// and prunes everything else under `dir`.
#[derive(Debug)]
pub struct ExtensionServicesConfigFilesController {
    dir: PathBuf,
}

impl ExtensionServicesConfigFilesController {
    /// Manages files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ExtensionServicesConfigFilesController { dir: dir.into() }
    }

    /// One reconcile pass.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))?;

        let mut wanted: HashMap<String, HashSet<String>> = HashMap::new();
        for ext in r.list::<ExtensionServicesConfig>()? {
            let files = wanted.entry(ext.id().to_string()).or_default();
            for file in &ext.spec.files {
                let name = config_file_name(&file.mount_path);
                let path = self.dir.join(ext.id()).join(&name);
                if write_if_changed(&path, file.content.as_bytes())
                    .with_context(|| format!("writing {}", path.display()))?
                {
                    info!(extension = %ext.id(), file = %name, "extension config written");
                }
                files.insert(name);
            }
        }

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let ext = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();

            let Some(files) = wanted.get(&ext) else {
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
                info!(extension = %ext, "extension config removed");
                continue;
            };

            if !entry.file_type()?.is_dir() {
                continue;
            }

            for file in fs::read_dir(&path)? {
                let file = file?;
                let name = file.file_name().to_string_lossy().into_owned();
                if files.contains(&name) {
                    continue;
                }
                if file.file_type()?.is_dir() {
                    fs::remove_dir_all(file.path())?;
                } else {
                    fs::remove_file(file.path())?;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for ExtensionServicesConfigFilesController {
    fn name(&self) -> &str {
        "runtime.ExtensionServicesConfigFilesController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<ExtensionServicesConfig>()]
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testutil::{new_store, put};
    use keel_resources::runtime::ExtensionServiceConfigFile;

    #[test]
    fn test_config_file_name() {
        assert_eq!(config_file_name("/etc/test"), "etc-test");
        assert_eq!(config_file_name("/usr/local/etc/nut/upsmon.conf"), "usr-local-etc-nut-upsmon.conf");
    }

    #[test]
    fn test_files_rendered_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store();
        let mut r = ControllerRuntime::standalone(
            "runtime.ExtensionServicesConfigFilesController",
            Arc::clone(&store),
            vec![],
            vec![],
        );
        let mut ctrl = ExtensionServicesConfigFilesController::new(dir.path());

        fs::create_dir_all(dir.path().join("gone")).unwrap();
        fs::write(dir.path().join("gone/etc-old"), "x").unwrap();
        fs::create_dir_all(dir.path().join("nut-client")).unwrap();
        fs::write(dir.path().join("nut-client/etc-stale"), "x").unwrap();

        put(
            &store,
            "nut-client",
            ExtensionServicesConfig {
                files: vec![ExtensionServiceConfigFile {
                    content: "MONITOR ups@host".into(),
                    mount_path: "/etc/test".into(),
                }],
                environment: vec![],
            },
        );

        ctrl.reconcile(&mut r).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("nut-client/etc-test")).unwrap(), "MONITOR ups@host");
        assert!(!dir.path().join("nut-client/etc-stale").exists());
        assert!(!dir.path().join("gone").exists());
    }
}
