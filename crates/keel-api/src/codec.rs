//! Event payload codec: machine events to and from `Any` by type URL.

use prost::Message;

use crate::error::{ApiError, Result};
use crate::proto::events::{
    ConfigLoadErrorEvent, MachineStatusEvent, PhaseEvent, SequenceEvent, ServiceStateEvent, TaskEvent,
};
use crate::proto::Any;

const TYPE_URL_PREFIX: &str = "keel/runtime/";

/// Type URL of [`SequenceEvent`].
pub const SEQUENCE_EVENT: &str = "keel/runtime/machine.SequenceEvent";
/// Type URL of [`PhaseEvent`].
pub const PHASE_EVENT: &str = "keel/runtime/machine.PhaseEvent";
/// Type URL of [`TaskEvent`].
pub const TASK_EVENT: &str = "keel/runtime/machine.TaskEvent";
/// Type URL of [`ServiceStateEvent`].
pub const SERVICE_STATE_EVENT: &str = "keel/runtime/machine.ServiceStateEvent";
/// Type URL of [`MachineStatusEvent`].
pub const MACHINE_STATUS_EVENT: &str = "keel/runtime/machine.MachineStatusEvent";
/// Type URL of [`ConfigLoadErrorEvent`].
pub const CONFIG_LOAD_ERROR_EVENT: &str = "keel/runtime/machine.ConfigLoadErrorEvent";

/// A machine event as published on the in-process event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Sequence progress.
    Sequence(SequenceEvent),
    /// Phase progress.
    Phase(PhaseEvent),
    /// Task progress.
    Task(TaskEvent),
    /// Service state change.
    ServiceState(ServiceStateEvent),
    /// Machine status change.
    MachineStatus(MachineStatusEvent),
    /// Machine configuration load failure.
    ConfigLoadError(ConfigLoadErrorEvent),
}

impl EventPayload {
    /// Type URL the payload is encoded under.
    pub fn type_url(&self) -> &'static str {
        match self {
            EventPayload::Sequence(_) => SEQUENCE_EVENT,
            EventPayload::Phase(_) => PHASE_EVENT,
            EventPayload::Task(_) => TASK_EVENT,
            EventPayload::ServiceState(_) => SERVICE_STATE_EVENT,
            EventPayload::MachineStatus(_) => MACHINE_STATUS_EVENT,
            EventPayload::ConfigLoadError(_) => CONFIG_LOAD_ERROR_EVENT,
        }
    }

    /// Encodes the payload.
    pub fn to_any(&self) -> Any {
        let value = match self {
            EventPayload::Sequence(m) => m.encode_to_vec(),
            EventPayload::Phase(m) => m.encode_to_vec(),
            EventPayload::Task(m) => m.encode_to_vec(),
            EventPayload::ServiceState(m) => m.encode_to_vec(),
            EventPayload::MachineStatus(m) => m.encode_to_vec(),
            EventPayload::ConfigLoadError(m) => m.encode_to_vec(),
        };

        Any {
            type_url: self.type_url().to_string(),
            value,
        }
    }

    /// Decodes a payload by dispatching on its type URL.
    pub fn from_any(any: &Any) -> Result<Self> {
        let buf = any.value.as_slice();

        Ok(match any.type_url.as_str() {
            SEQUENCE_EVENT => EventPayload::Sequence(SequenceEvent::decode(buf)?),
            PHASE_EVENT => EventPayload::Phase(PhaseEvent::decode(buf)?),
            TASK_EVENT => EventPayload::Task(TaskEvent::decode(buf)?),
            SERVICE_STATE_EVENT => EventPayload::ServiceState(ServiceStateEvent::decode(buf)?),
            MACHINE_STATUS_EVENT => EventPayload::MachineStatus(MachineStatusEvent::decode(buf)?),
            CONFIG_LOAD_ERROR_EVENT => EventPayload::ConfigLoadError(ConfigLoadErrorEvent::decode(buf)?),
            other => return Err(ApiError::UnknownPayload(other.to_string())),
        })
    }

    /// Message name without the type URL prefix, for logging.
    pub fn message_name(&self) -> &'static str {
        self.type_url().trim_start_matches(TYPE_URL_PREFIX)
    }
}
