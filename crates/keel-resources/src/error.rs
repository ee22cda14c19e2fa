//! Error types for resource and document handling.

use thiserror::Error;

/// Result type alias for resource operations.
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Error variants for document loading.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// I/O error reading a document.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML document could not be decoded.
    #[error("YAML decode error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON document could not be decoded.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown document format.
    #[error("unsupported document extension: {0}")]
    UnsupportedFormat(String),
}
