//! Hardware watchdog feeder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_resources::runtime::{WatchdogTimerConfig, WatchdogTimerStatus};
use keel_runtime::{
    CancellationToken, Controller, ControllerError, ControllerResult, ControllerRuntime, Input, Output, ResultExt,
};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::sys::watchdog::{feed_interval, Watchdog, WatchdogOpener};

struct Armed {
    device: String,
    timeout: Duration,
    watchdog: Box<dyn Watchdog>,
}

/// Arms the watchdog from [`WatchdogTimerConfig`] and feeds it at a third of
/// the timeout.
///
/// The device is always magic-closed before it is released, so stopping the
/// controller doesn't reboot the machine.
pub struct WatchdogTimerController {
    opener: Arc<dyn WatchdogOpener>,
    armed: Option<Armed>,
}

impl std::fmt::Debug for WatchdogTimerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogTimerController")
            .field("device", &self.armed.as_ref().map(|a| a.device.as_str()))
            .finish()
    }
}

impl WatchdogTimerController {
    /// Controller opening devices through `opener`.
    pub fn new(opener: Arc<dyn WatchdogOpener>) -> Self {
        WatchdogTimerController { opener, armed: None }
    }

    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            match armed.watchdog.magic_close() {
                Ok(()) => info!(device = %armed.device, "watchdog disarmed"),
                Err(err) => warn!(device = %armed.device, error = %err, "watchdog magic close failed"),
            }
        }
    }

    /// One reconcile pass. Returns the feed interval while armed.
    pub fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult<Option<Duration>> {
        let Some(cfg) = r.get::<WatchdogTimerConfig>(WatchdogTimerConfig::ID)? else {
            self.disarm();
            r.start_tracking_outputs();
            r.cleanup_outputs::<WatchdogTimerStatus>()?;
            return Ok(None);
        };
        let cfg = cfg.spec;

        let interval = feed_interval(cfg.timeout);
        if interval.is_zero() {
            self.disarm();
            return Err(ControllerError::Config(format!(
                "watchdog {} timeout {:?} is too short to feed",
                cfg.device, cfg.timeout
            )));
        }

        if self.armed.as_ref().is_some_and(|a| a.device != cfg.device) {
            self.disarm();
        }

        if self.armed.is_none() {
            let watchdog = self
                .opener
                .open(&cfg.device)
                .with_context(|| format!("opening watchdog {}", cfg.device))?;
            self.armed = Some(Armed {
                device: cfg.device.clone(),
                timeout: Duration::ZERO,
                watchdog,
            });
        }

        if let Some(armed) = self.armed.as_mut() {
            if armed.timeout != cfg.timeout {
                armed.watchdog.set_timeout(cfg.timeout).context("setting watchdog timeout")?;
                armed.timeout = cfg.timeout;
                info!(device = %armed.device, timeout = ?cfg.timeout, feed_interval = ?interval, "watchdog armed");
            }
            armed.watchdog.keepalive().context("feeding watchdog")?;
        }

        r.modify::<WatchdogTimerStatus, _>(WatchdogTimerStatus::ID, |status| {
            status.device = cfg.device;
            status.timeout = cfg.timeout;
            status.feed_interval = interval;
            Ok(())
        })?;

        Ok(Some(interval))
    }

    fn feed(&mut self) -> ControllerResult {
        if let Some(armed) = self.armed.as_mut() {
            armed.watchdog.keepalive().context("feeding watchdog")?;
        }
        Ok(())
    }

    async fn run_loop(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let mut ticker: Option<(Duration, Interval)> = None;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                    match self.reconcile(r)? {
                        Some(period) if ticker.as_ref().map(|(p, _)| *p) != Some(period) => {
                            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            ticker = Some((period, interval));
                        }
                        Some(_) => {}
                        None => ticker = None,
                    }
                }
                _ = async {
                    match ticker.as_mut() {
                        Some((_, interval)) => interval.tick().await,
                        None => std::future::pending().await,
                    }
                } => self.feed()?,
            }
        }
    }
}

#[async_trait]
impl Controller for WatchdogTimerController {
    fn name(&self) -> &str {
        "runtime.WatchdogTimerController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<WatchdogTimerConfig>().with_id(WatchdogTimerConfig::ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<WatchdogTimerStatus>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let result = self.run_loop(ctx, r).await;
        self.disarm();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use crate::testutil::{put, remove, standalone};
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeWatchdog {
        device: String,
        log: Log,
    }

    impl Watchdog for FakeWatchdog {
        fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.log.lock().push(format!("{} timeout {}", self.device, timeout.as_secs()));
            Ok(())
        }

        fn keepalive(&mut self) -> io::Result<()> {
            self.log.lock().push(format!("{} keepalive", self.device));
            Ok(())
        }

        fn magic_close(self: Box<Self>) -> io::Result<()> {
            self.log.lock().push(format!("{} close", self.device));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeOpener {
        log: Log,
    }

    impl WatchdogOpener for FakeOpener {
        fn open(&self, device: &str) -> io::Result<Box<dyn Watchdog>> {
            self.log.lock().push(format!("{device} open"));
            Ok(Box::new(FakeWatchdog {
                device: device.to_string(),
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn config(device: &str, secs: u64) -> WatchdogTimerConfig {
        WatchdogTimerConfig {
            device: device.into(),
            timeout: Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_device_change_magic_closes_old() {
        let opener = Arc::new(FakeOpener::default());
        let log = Arc::clone(&opener.log);
        let (store, mut r) = standalone::<WatchdogTimerStatus>("runtime.WatchdogTimerController");
        let mut ctrl = WatchdogTimerController::new(opener);

        put(&store, WatchdogTimerConfig::ID, config("/dev/watchdog0", 30));
        assert_eq!(ctrl.reconcile(&mut r).unwrap(), Some(Duration::from_secs(10)));

        let status = store.get_typed::<WatchdogTimerStatus>(WatchdogTimerStatus::ID).unwrap();
        assert_eq!(status.spec.feed_interval, Duration::from_secs(10));

        put(&store, WatchdogTimerConfig::ID, config("/dev/watchdog1", 30));
        ctrl.reconcile(&mut r).unwrap();

        remove::<WatchdogTimerConfig>(&store, WatchdogTimerConfig::ID);
        assert_eq!(ctrl.reconcile(&mut r).unwrap(), None);
        assert!(store.get_typed::<WatchdogTimerStatus>(WatchdogTimerStatus::ID).is_err());

        assert_eq!(
            *log.lock(),
            vec![
                "/dev/watchdog0 open",
                "/dev/watchdog0 timeout 30",
                "/dev/watchdog0 keepalive",
                "/dev/watchdog0 close",
                "/dev/watchdog1 open",
                "/dev/watchdog1 timeout 30",
                "/dev/watchdog1 keepalive",
                "/dev/watchdog1 close",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeds_until_cancelled() {
        let opener = Arc::new(FakeOpener::default());
        let log = Arc::clone(&opener.log);
        let (store, mut r) = standalone::<WatchdogTimerStatus>("runtime.WatchdogTimerController");
        put(&store, WatchdogTimerConfig::ID, config("/dev/watchdog0", 30));

        let ctx = CancellationToken::new();
        let stop = ctx.clone();
        r.queue_reconcile();

        let task = tokio::spawn(async move {
            let mut ctrl = WatchdogTimerController::new(opener);
            ctrl.run(&ctx, &mut r).await
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        stop.cancel();
        task.await.unwrap().unwrap();

        let log = log.lock();
        let feeds = log.iter().filter(|l| l.ends_with("keepalive")).count();
        // one on arming plus ticks at 10s, 20s and 30s
        assert_eq!(feeds, 4);
        assert_eq!(log.last().map(String::as_str), Some("/dev/watchdog0 close"));
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_without_arming() {
        let opener = Arc::new(FakeOpener::default());
        let log = Arc::clone(&opener.log);
        let (store, mut r) = standalone::<WatchdogTimerStatus>("runtime.WatchdogTimerController");
        put(
            &store,
            WatchdogTimerConfig::ID,
            WatchdogTimerConfig {
                device: "/dev/watchdog0".into(),
                timeout: Duration::ZERO,
            },
        );

        let ctx = CancellationToken::new();
        r.queue_reconcile();

        let mut ctrl = WatchdogTimerController::new(opener);
        let err = ctrl.run(&ctx, &mut r).await.unwrap_err();
        assert!(matches!(err, ControllerError::Config(_)));
        assert!(log.lock().is_empty());
        assert!(store.get_typed::<WatchdogTimerStatus>(WatchdogTimerStatus::ID).is_err());
    }
}
