//! Drain subscriptions used to flush in-flight work before process shutdown.
//!
//! Controllers which forward data (event sink, kernel log delivery) subscribe
//! to the drainer. When the drain starts every subscription is notified; the
//! drain completes once all subscriptions are cancelled or the timeout passes.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{info, warn};

/// Represents the current state of the drain process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrainState {
    /// Normal operation.
    Active = 0,
    /// Drain requested, waiting for subscriptions to finish.
    Draining = 1,
    /// All subscriptions finished.
    Drained = 2,
    /// Timeout exceeded before all subscriptions finished.
    ForceClosed = 3,
}

impl From<u8> for DrainState {
    fn from(value: u8) -> Self {
        match value {
            1 => DrainState::Draining,
            2 => DrainState::Drained,
            3 => DrainState::ForceClosed,
            _ => DrainState::Active,
        }
    }
}

struct Inner {
    state: AtomicU8,
    active: AtomicUsize,
    started: watch::Sender<bool>,
    finished: Notify,
}

/// Hands out drain subscriptions and runs the drain.
#[derive(Clone)]
pub struct Drainer {
    inner: Arc<Inner>,
}

impl Default for Drainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drainer {
    /// Creates a drainer.
    pub fn new() -> Self {
        let (started, _) = watch::channel(false);
        Drainer {
            inner: Arc::new(Inner {
                state: AtomicU8::new(DrainState::Active as u8),
                active: AtomicUsize::new(0),
                started,
                finished: Notify::new(),
            }),
        }
    }

    /// Current drain state.
    pub fn state(&self) -> DrainState {
        DrainState::from(self.inner.state.load(Ordering::SeqCst))
    }

    /// Number of live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Registers a new subscription.
    pub fn subscribe(&self) -> DrainSubscription {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        DrainSubscription {
            inner: Arc::clone(&self.inner),
            rx: self.inner.started.subscribe(),
            cancelled: false,
        }
    }

    /// Notifies all subscriptions and waits for them to cancel, bounded by `timeout`.
    pub async fn drain(&self, timeout: Duration) -> DrainState {
        self.inner.state.store(DrainState::Draining as u8, Ordering::SeqCst);
        self.inner.started.send_replace(true);

        info!(subscriptions = self.active_subscriptions(), "draining");

        let wait = async {
            loop {
                let notified = self.inner.finished.notified();
                if self.inner.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        let state = match tokio::time::timeout(timeout, wait).await {
            Ok(()) => DrainState::Drained,
            Err(_) => {
                warn!(remaining = self.active_subscriptions(), "drain timed out");
                DrainState::ForceClosed
            }
        };

        self.inner.state.store(state as u8, Ordering::SeqCst);
        state
    }
}

/// A subscription to the drain signal.
///
/// Dropping the subscription cancels it.
pub struct DrainSubscription {
    inner: Arc<Inner>,
    rx: watch::Receiver<bool>,
    cancelled: bool,
}

impl DrainSubscription {
    /// Resolves once the drain has been requested.
    pub async fn requested(&mut self) {
        // the sender lives as long as `inner`, so this only fails if it is gone
        let _ = self.rx.wait_for(|started| *started).await;
    }

    /// Checks without waiting whether the drain has been requested.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Marks the subscriber as finished.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            self.inner.finished.notify_waiters();
        }
    }
}

impl Drop for DrainSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
