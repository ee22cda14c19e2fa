//! Error types for resource store operations.

use thiserror::Error;

use crate::metadata::{Phase, Pointer, Version};

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Error variants returned by the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// The resource does not exist.
    #[error("resource {0} doesn't exist")]
    NotFound(Pointer),

    /// A resource with the same namespace, type and id is already present.
    #[error("resource {0} already exists")]
    AlreadyExists(Pointer),

    /// The supplied version doesn't match the stored one.
    #[error("resource {pointer} update conflict: expected version {expected}, found {found}")]
    VersionConflict {
        /// Resource being updated.
        pointer: Pointer,
        /// Version supplied by the caller.
        expected: Version,
        /// Version currently stored.
        found: Version,
    },

    /// The caller is not the recorded owner of the resource.
    #[error("resource {pointer} is owned by {owner:?}, not by {caller:?}")]
    OwnerMismatch {
        /// Resource being modified.
        pointer: Pointer,
        /// Recorded owner.
        owner: Option<String>,
        /// Caller identity.
        caller: Option<String>,
    },

    /// The resource still has finalizers attached.
    #[error("resource {pointer} has pending finalizers {finalizers:?}")]
    HasFinalizers {
        /// Resource being destroyed.
        pointer: Pointer,
        /// Finalizers still attached.
        finalizers: Vec<String>,
    },

    /// Destroy was requested for a resource which is still running.
    #[error("resource {0} is not in tearing down phase")]
    NotTearingDown(Pointer),

    /// The operation is not allowed in the current phase.
    #[error("resource {pointer} is in phase {phase}")]
    PhaseConflict {
        /// Resource being modified.
        pointer: Pointer,
        /// Current phase.
        phase: Phase,
    },

    /// The stored spec has a different type than requested.
    #[error("resource {pointer} has type {actual}, requested {requested}")]
    TypeMismatch {
        /// Resource being read.
        pointer: Pointer,
        /// Stored spec type.
        actual: String,
        /// Requested spec type.
        requested: String,
    },

    /// The watch was closed before the condition was met.
    #[error("watch closed")]
    WatchClosed,
}

impl StateError {
    /// Returns true if the error is [`StateError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }

    /// Returns true if the error is a conflict (already exists, version or phase conflict).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StateError::AlreadyExists(_)
                | StateError::VersionConflict { .. }
                | StateError::PhaseConflict { .. }
        )
    }
}
