#![warn(missing_docs)]

//! Keel resource store: typed, versioned, namespaced records with finalizers, phases and watches.
//!
//! The store is the single source of truth for the controller runtime. Every
//! record carries [`Metadata`] (namespace, type, id, version, phase, owner,
//! finalizers, labels) and a typed spec implementing [`ResourceType`].

pub mod error;
pub mod metadata;
pub mod resource;
pub mod store;
pub mod watch;

pub use error::{Result, StateError};
pub use metadata::{Kind, LabelQuery, LabelTerm, Metadata, Phase, Pointer, Version};
pub use resource::{AnySpec, Resource, ResourceType, Typed};
pub use store::Store;
pub use watch::{Event, EventType, WatchScope, Watcher};
