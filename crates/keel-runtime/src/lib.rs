#![warn(missing_docs)]

//! Keel controller runtime: dependency tracking, event fan-out, output cleanup, restart backoff, drain.
//!
//! Controllers declare their inputs and outputs at registration. The runtime
//! validates the dependency graph, feeds each controller a coalescing wakeup
//! channel and restarts failed controllers with exponential backoff.

pub mod adapter;
pub mod backoff;
pub mod controller;
pub mod drain;
pub mod error;
pub mod events;
pub mod runtime;

pub use adapter::ControllerRuntime;
pub use backoff::{Backoff, BackoffConfig};
pub use controller::{Controller, Input, InputKind, Output, OutputKind};
pub use drain::{DrainState, DrainSubscription, Drainer};
pub use error::{ControllerError, ControllerResult, ResultExt, RuntimeError};
pub use events::{Delivered, EventStream, EventWatcher, StreamEvent, TailOption};
pub use runtime::Runtime;

pub use tokio_util::sync::CancellationToken;
