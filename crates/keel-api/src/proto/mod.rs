//! Protobuf messages exchanged with the event sink, the maintenance API and
//! the container runtime image service.
//!
//! The messages are maintained by hand with `prost` derives; field tags match
//! the upstream `.proto` definitions so the encoding is wire compatible.

pub mod events;
pub mod images;
pub mod machine;

/// Protobuf `google.protobuf.Any`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Any {
    /// Type URL identifying the payload message.
    #[prost(string, tag = "1")]
    pub type_url: String,
    /// Encoded payload.
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Protobuf `google.protobuf.Timestamp`.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    /// Sub-second nanoseconds.
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    /// Converts to a `SystemTime`; pre-epoch values clamp to the epoch.
    pub fn to_system_time(self) -> std::time::SystemTime {
        let secs = u64::try_from(self.seconds).unwrap_or(0);
        let nanos = u32::try_from(self.nanos).unwrap_or(0);
        std::time::UNIX_EPOCH + std::time::Duration::new(secs, nanos)
    }

    /// Builds a timestamp from a `SystemTime`.
    pub fn from_system_time(t: std::time::SystemTime) -> Self {
        let d = t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
        Timestamp {
            seconds: d.as_secs() as i64,
            nanos: d.subsec_nanos() as i32,
        }
    }
}

/// Protobuf `google.protobuf.Empty`.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Empty {}

/// Error classification carried by sequence events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    /// The sequence failed and the machine can't continue.
    Fatal = 0,
    /// Another sequence holds the lock.
    Locked = 1,
    /// The sequence was cancelled.
    Canceled = 2,
}

/// Error attached to a sequence event.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorInfo {
    /// Error class.
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    /// Human readable message.
    #[prost(string, tag = "2")]
    pub message: String,
}
