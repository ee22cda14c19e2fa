//! Log and event delivery: event sink streaming, kernel log forwarding and
//! service log files.

mod event_sink;
mod kmsg;
mod persistence;

pub use event_sink::EventsSinkController;
pub use kmsg::{kmsg_follower, KmsgFollower, KmsgLogDeliveryController, DRAIN_QUIET_PERIOD};
pub use persistence::{LogPersistence, LogPersistenceConfig, LogPersistenceController, VOLUME_VAR_LOG};
