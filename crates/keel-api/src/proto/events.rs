//! Machine event messages published on the event stream and forwarded to the event sink.

use super::{Any, ErrorInfo};

/// Request sent to the event sink for every forwarded event.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EventRequest {
    /// Event id; ids sort in publication order.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Encoded payload.
    #[prost(message, optional, tag = "2")]
    pub data: Option<Any>,
    /// Actor which caused the event.
    #[prost(string, tag = "3")]
    pub actor_id: String,
}

/// Event sink acknowledgement.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct EventResponse {}

/// Sequence action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SequenceAction {
    /// The sequence was not run.
    Noop = 0,
    /// The sequence started.
    Start = 1,
    /// The sequence finished.
    Stop = 2,
}

/// Sequence progress.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SequenceEvent {
    /// Sequence name (`boot`, `install`, `upgrade`...).
    #[prost(string, tag = "1")]
    pub sequence: String,
    /// What happened.
    #[prost(enumeration = "SequenceAction", tag = "2")]
    pub action: i32,
    /// Failure, if any.
    #[prost(message, optional, tag = "3")]
    pub error: Option<ErrorInfo>,
}

/// Phase or task action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StepAction {
    /// Started.
    Start = 0,
    /// Finished.
    Stop = 1,
}

/// Phase progress within a sequence.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PhaseEvent {
    /// Phase name.
    #[prost(string, tag = "1")]
    pub phase: String,
    /// What happened.
    #[prost(enumeration = "StepAction", tag = "2")]
    pub action: i32,
}

/// Task progress within a phase.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskEvent {
    /// Task name.
    #[prost(string, tag = "1")]
    pub task: String,
    /// What happened.
    #[prost(enumeration = "StepAction", tag = "2")]
    pub action: i32,
}

/// Service health as reported with a state change.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceHealth {
    /// Health is not known yet.
    #[prost(bool, tag = "1")]
    pub unknown: bool,
    /// Last health check passed.
    #[prost(bool, tag = "2")]
    pub healthy: bool,
    /// Last health check message.
    #[prost(string, tag = "3")]
    pub last_message: String,
}

/// Service state change.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceStateEvent {
    /// Service id.
    #[prost(string, tag = "1")]
    pub service: String,
    /// New state (`Running`, `Finished`...).
    #[prost(string, tag = "2")]
    pub action: String,
    /// Details.
    #[prost(string, tag = "3")]
    pub message: String,
    /// Health at the time of the change.
    #[prost(message, optional, tag = "4")]
    pub health: Option<ServiceHealth>,
}

/// Machine stage as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MachineStage {
    /// Not known.
    Unknown = 0,
    /// Booting.
    Booting = 1,
    /// Installing.
    Installing = 2,
    /// Maintenance mode.
    Maintenance = 3,
    /// Running.
    Running = 4,
    /// Rebooting.
    Rebooting = 5,
    /// Shutting down.
    ShuttingDown = 6,
    /// Resetting.
    Resetting = 7,
    /// Upgrading.
    Upgrading = 8,
}

/// A readiness check which doesn't pass.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UnmetCondition {
    /// Check name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Why the check fails.
    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Machine readiness.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MachineStatus {
    /// All checks pass.
    #[prost(bool, tag = "1")]
    pub ready: bool,
    /// Failing checks.
    #[prost(message, repeated, tag = "2")]
    pub unmet_conditions: Vec<UnmetCondition>,
}

/// Machine status change.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MachineStatusEvent {
    /// Current stage.
    #[prost(enumeration = "MachineStage", tag = "1")]
    pub stage: i32,
    /// Current readiness.
    #[prost(message, optional, tag = "2")]
    pub status: Option<MachineStatus>,
}

/// Machine configuration failed to load.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConfigLoadErrorEvent {
    /// Load error.
    #[prost(string, tag = "1")]
    pub error: String,
}
