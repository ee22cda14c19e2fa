//! In-process event stream backed by a bounded ring buffer.
//!
//! Publishers append events; watchers read from a chosen position (only new
//! events, the last N retained events, or right after a known event id). A
//! watcher falling behind the buffer skips to the oldest retained event.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::error::RuntimeError;

/// Default number of retained events.
pub const DEFAULT_CAPACITY: usize = 1000;

/// An event in the stream.
#[derive(Debug, Clone)]
pub struct StreamEvent<P> {
    /// Unique event id.
    pub id: String,
    /// Publication time.
    pub timestamp: SystemTime,
    /// Id of the actor which caused the event, if any.
    pub actor_id: String,
    /// Event payload.
    pub payload: P,
}

/// An event handed to a watcher together with the number of events queued after it.
#[derive(Debug, Clone)]
pub struct Delivered<P> {
    /// The event.
    pub event: Arc<StreamEvent<P>>,
    /// Events published after this one which the watcher hasn't read yet.
    pub backlog: usize,
}

/// Where a watcher starts reading.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TailOption {
    /// Only events published after the watch starts.
    #[default]
    New,
    /// The last `n` retained events; a negative value means every retained event.
    TailEvents(i64),
    /// Events published after the event with the given id.
    TailId(String),
}

struct Ring<P> {
    events: VecDeque<Arc<StreamEvent<P>>>,
    /// Absolute position of `events[0]`.
    first: u64,
    capacity: usize,
}

impl<P> Ring<P> {
    fn next(&self) -> u64 {
        self.first + self.events.len() as u64
    }
}

/// The event stream.
pub struct EventStream<P> {
    ring: Arc<RwLock<Ring<P>>>,
    position: watch::Sender<u64>,
}

impl<P> Clone for EventStream<P> {
    fn clone(&self) -> Self {
        EventStream {
            ring: Arc::clone(&self.ring),
            position: self.position.clone(),
        }
    }
}

impl<P: Send + Sync + 'static> EventStream<P> {
    /// Creates a stream retaining up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (position, _) = watch::channel(0);
        EventStream {
            ring: Arc::new(RwLock::new(Ring {
                events: VecDeque::with_capacity(capacity),
                first: 0,
                capacity: capacity.max(1),
            })),
            position,
        }
    }

    /// Publishes an event without an actor id; returns its id.
    pub fn publish(&self, payload: P) -> String {
        self.publish_with_actor(payload, String::new())
    }

    /// Publishes an event; returns its id.
    pub fn publish_with_actor(&self, payload: P, actor_id: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let event = Arc::new(StreamEvent {
            id: id.clone(),
            timestamp: SystemTime::now(),
            actor_id: actor_id.into(),
            payload,
        });

        let next = {
            let mut ring = self.ring.write();
            if ring.events.len() == ring.capacity {
                ring.events.pop_front();
                ring.first += 1;
            }
            ring.events.push_back(event);
            ring.next()
        };

        self.position.send_replace(next);
        id
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.ring.read().events.len()
    }

    /// Whether no events are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a watcher at the requested position.
    pub fn watch(&self, tail: TailOption) -> Result<EventWatcher<P>, RuntimeError> {
        let ring = self.ring.read();

        let pos = match tail {
            TailOption::New => ring.next(),
            TailOption::TailEvents(n) if n < 0 => ring.first,
            TailOption::TailEvents(n) => ring.next().saturating_sub(n as u64).max(ring.first),
            TailOption::TailId(id) => {
                let idx = ring
                    .events
                    .iter()
                    .position(|e| e.id == id)
                    .ok_or(RuntimeError::EventNotFound(id))?;
                ring.first + idx as u64 + 1
            }
        };

        Ok(EventWatcher {
            ring: Arc::clone(&self.ring),
            position: self.position.subscribe(),
            pos,
        })
    }
}

/// Reads events from the stream in publication order.
pub struct EventWatcher<P> {
    ring: Arc<RwLock<Ring<P>>>,
    position: watch::Receiver<u64>,
    pos: u64,
}

impl<P> EventWatcher<P> {
    /// Returns the next event if one is available.
    pub fn try_next(&mut self) -> Option<Delivered<P>> {
        let ring = self.ring.read();

        if self.pos < ring.first {
            warn!(skipped = ring.first - self.pos, "event watcher overrun, skipping to oldest event");
            self.pos = ring.first;
        }

        let idx = (self.pos - ring.first) as usize;
        let event = ring.events.get(idx)?;
        self.pos += 1;

        Some(Delivered {
            event: Arc::clone(event),
            backlog: (ring.next() - self.pos) as usize,
        })
    }

    /// Number of events published but not yet returned.
    pub fn pending(&self) -> usize {
        let ring = self.ring.read();
        (ring.next() - self.pos.max(ring.first)) as usize
    }

    /// Waits for the next event; returns `None` if the stream is gone.
    pub async fn recv(&mut self) -> Option<Delivered<P>> {
        loop {
            if let Some(delivered) = self.try_next() {
                return Some(delivered);
            }

            let pos = self.pos;
            if self.position.wait_for(|next| *next > pos).await.is_err() {
                return self.try_next();
            }
        }
    }
}
