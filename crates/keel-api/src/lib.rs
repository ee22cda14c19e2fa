#![warn(missing_docs)]

//! Keel wire layer: protobuf messages, gRPC plumbing and the event payload codec.
//!
//! Three services are spoken here: the event sink (client side, plain-text
//! gRPC), the maintenance API (server side, TLS with role-based
//! authorization) and the container runtime image service (client side over
//! a unix socket).

pub mod codec;
pub mod error;
pub mod event_sink;
mod grpc;
pub mod images;
pub mod maintenance;
pub mod proto;

pub use codec::EventPayload;
pub use error::{ApiError, Result};
pub use event_sink::{EventSink, EventSinkClient, EventSinkServer};
pub use images::ImagesClient;
pub use maintenance::{MachineService, MachineServiceClient, MaintenanceServer, Role, TlsMaterial};
