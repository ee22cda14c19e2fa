//! Periodic filesystem scrubs of mounted XFS volumes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keel_resources::block::{FilesystemType, VolumeConfig, VolumePhase, VolumeStatus};
use keel_resources::runtime::{FSScrubConfig, FSScrubStatus};
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output};
use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::sys::scrub::Scrubber;

/// Picks the delay of the first run of a scrub with the given period.
pub type FirstDelay = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Uniformly random delay in `[0, period)`.
pub fn random_first_delay(period: Duration) -> Duration {
    if period.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..period.as_nanos());
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[derive(Debug)]
struct Scheduled {
    mountpoint: String,
    period: Duration,
    next: Instant,
}

/// Schedules [`FSScrubConfig`]s whose mountpoint carries a ready XFS volume
/// and publishes [`FSScrubStatus`].
pub struct FSScrubController {
    scrubber: Arc<dyn Scrubber>,
    first_delay: FirstDelay,
    schedule: BTreeMap<String, Scheduled>,
}

impl std::fmt::Debug for FSScrubController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FSScrubController").field("schedule", &self.schedule).finish()
    }
}

impl FSScrubController {
    /// Controller with randomized first runs.
    pub fn new(scrubber: Arc<dyn Scrubber>) -> Self {
        Self::with_first_delay(scrubber, Arc::new(random_first_delay))
    }

    /// Controller with a custom first-run delay.
    pub fn with_first_delay(scrubber: Arc<dyn Scrubber>, first_delay: FirstDelay) -> Self {
        FSScrubController {
            scrubber,
            first_delay,
            schedule: BTreeMap::new(),
        }
    }

    fn mounted_xfs(r: &ControllerRuntime) -> ControllerResult<HashSet<String>> {
        let mut mounted = HashSet::new();
        for status in r.list::<VolumeStatus>()? {
            if status.spec.phase != VolumePhase::Ready || status.spec.filesystem != FilesystemType::Xfs {
                continue;
            }
            if let Some(cfg) = r.get::<VolumeConfig>(status.id())? {
                if !cfg.spec.mount.target_path.is_empty() {
                    mounted.insert(cfg.spec.mount.target_path);
                }
            }
        }
        Ok(mounted)
    }

    /// One reconcile pass at `now`.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime, now: Instant) -> ControllerResult {
        let mounted = Self::mounted_xfs(r)?;
        let configs: Vec<_> = r
            .list::<FSScrubConfig>()?
            .into_iter()
            .filter(|c| mounted.contains(&c.spec.mountpoint) && !c.spec.period.is_zero())
            .collect();

        r.start_tracking_outputs();

        let mut wanted = HashSet::new();
        for cfg in configs {
            let id = cfg.id().to_string();
            wanted.insert(id.clone());

            let entry = self.schedule.entry(id.clone()).or_insert_with(|| {
                let delay = (self.first_delay)(cfg.spec.period);
                info!(mountpoint = %cfg.spec.mountpoint, ?delay, "filesystem scrub scheduled");
                Scheduled {
                    mountpoint: cfg.spec.mountpoint.clone(),
                    period: cfg.spec.period,
                    next: now + delay,
                }
            });

            if entry.period != cfg.spec.period || entry.mountpoint != cfg.spec.mountpoint {
                entry.period = cfg.spec.period;
                entry.mountpoint = cfg.spec.mountpoint.clone();
                entry.next = now + entry.period;
            }

            let planned = Utc::now() + chrono::Duration::from_std(entry.next - now).unwrap_or_else(|_| chrono::Duration::zero());
            let (mountpoint, period) = (entry.mountpoint.clone(), entry.period);
            r.modify::<FSScrubStatus, _>(&id, |status| {
                status.mountpoint = mountpoint;
                status.period = period;
                if status.status.is_empty() || status.status == "scheduled" {
                    status.status = "scheduled".to_string();
                    status.time = Some(planned);
                }
                Ok(())
            })?;
        }

        self.schedule.retain(|id, _| wanted.contains(id));

        r.cleanup_outputs::<FSScrubStatus>()
    }

    /// Earliest pending run.
    pub fn next_due(&self) -> Option<Instant> {
        self.schedule.values().map(|s| s.next).min()
    }

    /// Runs every scrub due at `now` and reschedules it one period later.
    pub async fn run_due(&mut self, r: &mut ControllerRuntime, now: Instant) -> ControllerResult {
        let due: Vec<String> = self
            .schedule
            .iter()
            .filter(|(_, s)| s.next <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let Some(entry) = self.schedule.get_mut(&id) else {
                continue;
            };
            entry.next = now + entry.period;
            let mountpoint = entry.mountpoint.clone();

            let started = Utc::now();
            let clock = std::time::Instant::now();
            let outcome = match self.scrubber.scrub(&mountpoint).await {
                Ok(()) => {
                    info!(%mountpoint, "filesystem scrub finished");
                    "success".to_string()
                }
                Err(err) => {
                    warn!(%mountpoint, error = %err, "filesystem scrub failed");
                    err.to_string()
                }
            };
            let elapsed = clock.elapsed();

            r.modify::<FSScrubStatus, _>(&id, |status| {
                status.time = Some(started);
                status.duration = elapsed;
                status.status = outcome;
                Ok(())
            })?;
        }

        Ok(())
    }
}

#[async_trait]
impl Controller for FSScrubController {
    fn name(&self) -> &str {
        "runtime.FSScrubController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<FSScrubConfig>(),
            Input::weak::<VolumeStatus>(),
            Input::weak::<VolumeConfig>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<FSScrubStatus>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        loop {
            let next = self.next_due();

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = r.event() => self.reconcile(r, Instant::now())?,
                _ = async {
                    match next {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(()),
                        res = self.run_due(r, Instant::now()) => res?,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use crate::testutil::{put, remove, standalone};
    use keel_resources::block::MountSpec;
    use keel_state::Store;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingScrubber {
        runs: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl Scrubber for RecordingScrubber {
        async fn scrub(&self, mountpoint: &str) -> io::Result<()> {
            self.runs.lock().push((mountpoint.to_string(), Instant::now()));
            if mountpoint == "/var/broken" {
                return Err(io::Error::other("corruption found"));
            }
            Ok(())
        }
    }

    fn mount_xfs(store: &Store, id: &str, target: &str) {
        put(
            store,
            id,
            VolumeConfig {
                mount: MountSpec {
                    target_path: target.into(),
                },
                ..Default::default()
            },
        );
        put(
            store,
            id,
            VolumeStatus {
                phase: VolumePhase::Ready,
                filesystem: FilesystemType::Xfs,
                ..Default::default()
            },
        );
    }

    fn scrub(store: &Store, id: &str, mountpoint: &str, period: Duration) {
        put(
            store,
            id,
            FSScrubConfig {
                name: id.into(),
                mountpoint: mountpoint.into(),
                period,
            },
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_once_per_period_after_first_delay() {
        let scrubber = Arc::new(RecordingScrubber::default());
        let (store, mut r) = standalone::<FSScrubStatus>("runtime.FSScrubController");
        let mut ctrl = FSScrubController::with_first_delay(scrubber.clone(), Arc::new(|_| Duration::from_secs(5)));

        mount_xfs(&store, "EPHEMERAL", "/var");
        scrub(&store, "var", "/var", Duration::from_secs(60));

        let start = Instant::now();
        ctrl.reconcile(&mut r, start).unwrap();
        assert_eq!(store.get_typed::<FSScrubStatus>("var").unwrap().spec.status, "scheduled");
        assert_eq!(ctrl.next_due(), Some(start + Duration::from_secs(5)));

        for _ in 0..3 {
            let at = ctrl.next_due().unwrap();
            tokio::time::sleep_until(at).await;
            ctrl.run_due(&mut r, at).await.unwrap();
        }

        let runs = scrubber.runs.lock();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[1].1 - runs[0].1, Duration::from_secs(60));
        assert_eq!(runs[2].1 - runs[1].1, Duration::from_secs(60));
        assert_eq!(store.get_typed::<FSScrubStatus>("var").unwrap().spec.status, "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_recorded_in_status() {
        let scrubber = Arc::new(RecordingScrubber::default());
        let (store, mut r) = standalone::<FSScrubStatus>("runtime.FSScrubController");
        let mut ctrl = FSScrubController::with_first_delay(scrubber, Arc::new(|_| Duration::ZERO));

        mount_xfs(&store, "DATA", "/var/broken");
        scrub(&store, "broken", "/var/broken", Duration::from_secs(60));

        let now = Instant::now();
        ctrl.reconcile(&mut r, now).unwrap();
        ctrl.run_due(&mut r, now).await.unwrap();

        let status = store.get_typed::<FSScrubStatus>("broken").unwrap();
        assert_eq!(status.spec.status, "corruption found");
        assert!(status.spec.time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmounted_volume_cancels_scrub() {
        let scrubber = Arc::new(RecordingScrubber::default());
        let (store, mut r) = standalone::<FSScrubStatus>("runtime.FSScrubController");
        let mut ctrl = FSScrubController::with_first_delay(scrubber, Arc::new(|_| Duration::ZERO));

        mount_xfs(&store, "EPHEMERAL", "/var");
        scrub(&store, "var", "/var", Duration::from_secs(60));
        ctrl.reconcile(&mut r, Instant::now()).unwrap();
        assert!(ctrl.next_due().is_some());

        remove::<VolumeStatus>(&store, "EPHEMERAL");
        ctrl.reconcile(&mut r, Instant::now()).unwrap();

        assert!(ctrl.next_due().is_none());
        assert!(store.get_typed::<FSScrubStatus>("var").is_err());
    }

    #[test]
    fn test_random_first_delay_within_period() {
        for _ in 0..100 {
            assert!(random_first_delay(Duration::from_secs(10)) < Duration::from_secs(10));
        }
        assert_eq!(random_first_delay(Duration::ZERO), Duration::ZERO);
    }
}
