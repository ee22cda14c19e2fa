//! Service log files on the `/var/log` volume.
//!
//! Producers write through a [`LogPersistence`] handle. Every write takes the
//! read side of a lock whose write side the controller holds whenever the
//! volume is not mounted, so early writes wait for the mount instead of
//! failing.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_resources::block::{VolumeMountRequest, VolumeMountStatus};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output};
use keel_state::Phase;
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

/// Volume backing the service logs.
pub const VOLUME_VAR_LOG: &str = "/var/log";

/// Tuning for [`LogPersistenceController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPersistenceConfig {
    /// Interval between buffer flushes.
    pub flush_period: Duration,
    /// Size in bytes past which a file is rotated.
    pub rotation_threshold: u64,
    /// Write buffer per file.
    pub buffer_size: usize,
}

impl Default for LogPersistenceConfig {
    fn default() -> Self {
        LogPersistenceConfig {
            flush_period: Duration::from_secs(10),
            rotation_threshold: 512 * 1024,
            buffer_size: 4096,
        }
    }
}

struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

#[derive(Default)]
struct LogState {
    dir: Option<PathBuf>,
    files: Mutex<HashMap<String, LogFile>>,
}

impl LogState {
    fn write(&self, config: &LogPersistenceConfig, service: &str, line: &[u8]) -> io::Result<()> {
        let dir = self
            .dir
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "log volume is not mounted"))?;
        validate_service(service)?;

        let mut files = self.files.lock();
        let file = match files.entry(service.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(open_log(dir, service, config.buffer_size)?),
        };

        file.writer.write_all(line)?;
        file.size += line.len() as u64;
        if !line.ends_with(b"\n") {
            file.writer.write_all(b"\n")?;
            file.size += 1;
        }

        if file.size > config.rotation_threshold {
            if let Some(mut file) = files.remove(service) {
                file.writer.flush()?;
                let rotated = rotated_path(&file.path);
                drop(file.writer);
                fs::rename(&file.path, &rotated)?;
                debug!(service, path = %rotated.display(), "rotated log file");
            }
        }

        Ok(())
    }

    fn flush(&self) {
        for (service, file) in self.files.lock().iter_mut() {
            if let Err(err) = file.writer.flush() {
                warn!(service = %service, error = %err, "failed to flush log file");
            }
        }
    }

    fn close(&mut self) {
        self.flush();
        self.files.lock().clear();
        self.dir = None;
    }
}

fn validate_service(service: &str) -> io::Result<()> {
    if service.is_empty() || service.starts_with('.') || service.contains(['/', '\0']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid service name {service:?}"),
        ));
    }
    Ok(())
}

fn open_log(dir: &Path, service: &str, buffer_size: usize) -> io::Result<LogFile> {
    let path = dir.join(format!("{service}.log"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let size = file.metadata()?.len();
    Ok(LogFile {
        path,
        writer: BufWriter::with_capacity(buffer_size, file),
        size,
    })
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".1");
    PathBuf::from(rotated)
}

/// Handle for appending to service logs.
#[derive(Clone)]
pub struct LogPersistence {
    state: Arc<RwLock<LogState>>,
    config: LogPersistenceConfig,
}

impl std::fmt::Debug for LogPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPersistence").field("config", &self.config).finish()
    }
}

impl LogPersistence {
    /// Appends one line to `<mount>/<service>.log`, waiting for the volume.
    pub async fn write_log(&self, service: &str, line: &[u8]) -> io::Result<()> {
        let state = self.state.read().await;
        state.write(&self.config, service, line)
    }

    /// Flushes buffered lines of every open file.
    pub async fn flush(&self) {
        self.state.read().await.flush();
    }
}

/// Mounts `/var/log` and gates [`LogPersistence`] writers on it.
pub struct LogPersistenceController {
    handle: LogPersistence,
    guard: Option<OwnedRwLockWriteGuard<LogState>>,
}

impl std::fmt::Debug for LogPersistenceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPersistenceController")
            .field("mounted", &self.guard.is_none())
            .finish()
    }
}

impl LogPersistenceController {
    /// Controller starting with writers blocked.
    pub fn new(config: LogPersistenceConfig) -> Self {
        let state = Arc::new(RwLock::new(LogState::default()));
        let guard = Arc::clone(&state).try_write_owned().ok();
        LogPersistenceController {
            handle: LogPersistence { state, config },
            guard,
        }
    }

    /// Writer handle for log producers.
    pub fn writer(&self) -> LogPersistence {
        self.handle.clone()
    }

    /// Requests the mount and opens or closes the log directory to match it.
    pub async fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let name = r.name().to_string();
        let id = mount_id(&name);

        let requester = name.clone();
        r.modify::<VolumeMountRequest, _>(&id, |req| {
            req.volume_id = VOLUME_VAR_LOG.to_string();
            req.requester = requester;
            Ok(())
        })?;

        match r.get::<VolumeMountStatus>(&id)? {
            Some(mount) if mount.metadata.phase() == Phase::Running => {
                if !mount.metadata.finalizers().contains(&name) {
                    r.add_finalizer(mount.metadata.pointer(), &name)?;
                }
                if let Some(mut guard) = self.guard.take() {
                    guard.dir = Some(PathBuf::from(&mount.spec.target));
                    info!(target = %mount.spec.target, "log volume mounted, releasing writers");
                }
            }
            Some(mount) => {
                self.block_writers().await;
                r.remove_finalizer(mount.metadata.pointer(), &name)?;
            }
            None => self.block_writers().await,
        }

        Ok(())
    }

    async fn block_writers(&mut self) {
        if self.guard.is_some() {
            return;
        }
        let mut guard = Arc::clone(&self.handle.state).write_owned().await;
        guard.close();
        self.guard = Some(guard);
        info!("log volume going away, blocking writers");
    }

    async fn flush(&self) {
        if self.guard.is_none() {
            self.handle.flush().await;
        }
    }
}

fn mount_id(controller: &str) -> String {
    format!("{controller}-{VOLUME_VAR_LOG}")
}

#[async_trait]
impl Controller for LogPersistenceController {
    fn name(&self) -> &str {
        "runtime.LogPersistenceController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::strong::<VolumeMountStatus>(),
            Input::destroy_ready::<VolumeMountRequest>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared::<VolumeMountRequest>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let mut ticker = tokio::time::interval(self.handle.config.flush_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let res = loop {
            tokio::select! {
                _ = ctx.cancelled() => break Ok(()),
                _ = ticker.tick() => self.flush().await,
                ev = r.event() => {
                    if ev.is_none() {
                        break Ok(());
                    }
                    if let Err(err) = self.reconcile(r).await {
                        break Err(err);
                    }
                }
            }
        };

        self.flush().await;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::{put, standalone_with};
    use keel_state::{Pointer, ResourceType};

    const NAME: &str = "runtime.LogPersistenceController";

    fn setup() -> (Arc<keel_state::Store>, ControllerRuntime) {
        standalone_with(NAME, vec![Output::shared::<VolumeMountRequest>()])
    }

    fn mounted(store: &keel_state::Store, target: &Path) {
        put(
            store,
            &mount_id(NAME),
            VolumeMountStatus {
                volume_id: VOLUME_VAR_LOG.into(),
                requester: NAME.into(),
                target: target.to_string_lossy().into_owned(),
                read_only: false,
            },
        );
    }

    fn small_config() -> LogPersistenceConfig {
        LogPersistenceConfig {
            rotation_threshold: 16,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_writes_wait_for_mount() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut r) = setup();
        let mut ctrl = LogPersistenceController::new(LogPersistenceConfig::default());
        let writer = ctrl.writer();

        let pending = tokio::spawn({
            let writer = writer.clone();
            async move { writer.write_log("kubelet", b"early line").await }
        });

        ctrl.reconcile(&mut r).await.unwrap();
        let req = store.get_typed::<VolumeMountRequest>(&mount_id(NAME)).unwrap().spec;
        assert_eq!(req.volume_id, VOLUME_VAR_LOG);
        assert_eq!(req.requester, NAME);

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        mounted(&store, dir.path());
        ctrl.reconcile(&mut r).await.unwrap();
        pending.await.unwrap().unwrap();

        writer.write_log("kubelet", b"second line\n").await.unwrap();
        writer.flush().await;

        let contents = fs::read_to_string(dir.path().join("kubelet.log")).unwrap();
        assert_eq!(contents, "early line\nsecond line\n");
    }

    #[tokio::test]
    async fn test_rotation_keeps_one_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut r) = setup();
        let mut ctrl = LogPersistenceController::new(small_config());
        let writer = ctrl.writer();

        mounted(&store, dir.path());
        ctrl.reconcile(&mut r).await.unwrap();

        writer.write_log("etcd", b"0123456789").await.unwrap();
        writer.write_log("etcd", b"abcdefghij").await.unwrap();
        writer.write_log("etcd", b"klmnopqrst").await.unwrap();
        writer.write_log("etcd", b"uvwxyz0123").await.unwrap();
        writer.flush().await;

        assert_eq!(
            fs::read_to_string(dir.path().join("etcd.log.1")).unwrap(),
            "klmnopqrst\nuvwxyz0123\n"
        );
        assert!(!dir.path().join("etcd.log").exists());
        assert!(!dir.path().join("etcd.log.2").exists());

        writer.write_log("etcd", b"fresh").await.unwrap();
        writer.flush().await;
        assert_eq!(fs::read_to_string(dir.path().join("etcd.log")).unwrap(), "fresh\n");
    }

    #[tokio::test]
    async fn test_rejects_path_like_service_names() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut r) = setup();
        let mut ctrl = LogPersistenceController::new(LogPersistenceConfig::default());
        mounted(&store, dir.path());
        ctrl.reconcile(&mut r).await.unwrap();

        let err = ctrl.writer().write_log("../etc/passwd", b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_teardown_closes_files_and_releases_mount() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut r) = setup();
        let mut ctrl = LogPersistenceController::new(LogPersistenceConfig::default());
        let writer = ctrl.writer();

        mounted(&store, dir.path());
        ctrl.reconcile(&mut r).await.unwrap();
        writer.write_log("apid", b"buffered").await.unwrap();

        let ptr = Pointer::new(VolumeMountStatus::NAMESPACE, VolumeMountStatus::TYPE, mount_id(NAME));
        assert!(store.get(&ptr).unwrap().metadata().finalizers().contains(NAME));

        store.teardown(&ptr, None).unwrap();
        ctrl.reconcile(&mut r).await.unwrap();

        assert!(store.get(&ptr).unwrap().metadata().finalizers().is_empty());
        assert_eq!(fs::read_to_string(dir.path().join("apid.log")).unwrap(), "buffered\n");

        let blocked = tokio::spawn(async move { writer.write_log("apid", b"late").await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());
        blocked.abort();
    }
}
