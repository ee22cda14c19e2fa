//! Error types for the controller runtime.

use std::error::Error as StdError;

use keel_state::StateError;
use thiserror::Error;

/// Errors rejected at controller registration or raised by the runtime itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A controller with the same name is already registered.
    #[error("controller {0} is already registered")]
    DuplicateController(String),

    /// Two controllers claim the same output type, at least one exclusively.
    #[error("output {res_type} of controller {controller} conflicts with controller {existing}")]
    OutputConflict {
        /// Output type.
        res_type: String,
        /// Controller being registered.
        controller: String,
        /// Controller already holding the output.
        existing: String,
    },

    /// An input references a type unknown to the store.
    #[error("controller {controller} input references undefined type {res_type}")]
    UndefinedKind {
        /// Controller being registered.
        controller: String,
        /// Unknown type.
        res_type: String,
    },

    /// Strong inputs would form a dependency cycle.
    #[error("strong dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// The event id requested for tailing is no longer retained.
    #[error("event {0} not found in buffer")]
    EventNotFound(String),
}

/// Errors returned by a controller run.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Store operation failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// The controller wrote a type it didn't declare as output.
    #[error("controller {controller} doesn't declare output {res_type}")]
    OutputNotDeclared {
        /// Offending controller.
        controller: String,
        /// Undeclared type.
        res_type: String,
    },

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A failure with a description of what was being done.
    #[error("{context}: {source}")]
    Context {
        /// What was being done.
        context: String,
        /// Underlying error.
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// Result of a controller run or runtime helper.
pub type ControllerResult<T = ()> = std::result::Result<T, ControllerError>;

/// Attaches context to errors, turning them into [`ControllerError::Context`].
pub trait ResultExt<T> {
    /// Wraps the error with a static description.
    fn context(self, context: &str) -> ControllerResult<T>;

    /// Wraps the error with a lazily built description.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> ControllerResult<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn context(self, context: &str) -> ControllerResult<T> {
        self.map_err(|e| ControllerError::Context {
            context: context.to_string(),
            source: Box::new(e),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> ControllerResult<T> {
        self.map_err(|e| ControllerError::Context {
            context: f(),
            source: Box::new(e),
        })
    }
}

impl ControllerError {
    /// Returns the underlying store error, if any.
    pub fn as_state(&self) -> Option<&StateError> {
        match self {
            ControllerError::State(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_context_wraps_source() {
        let res: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        let err = res.context("error reading /proc/modules").unwrap_err();
        assert_eq!(err.to_string(), "error reading /proc/modules: no such file");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_cycle_display() {
        let err = RuntimeError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "strong dependency cycle: a -> b -> a");
    }
}
