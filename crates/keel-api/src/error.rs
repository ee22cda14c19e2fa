//! Error types for the wire layer.

use thiserror::Error;

/// Result type alias for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Error variants for the wire layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection or server transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The remote returned a gRPC status.
    #[error("rpc failed: {0}")]
    Status(#[from] tonic::Status),

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// An `Any` carried an unknown type URL.
    #[error("unknown payload type: {0}")]
    UnknownPayload(String),

    /// An endpoint string is not a valid URI.
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    /// A runtime namespace isn't a valid header value.
    #[error("invalid runtime namespace {0:?}")]
    InvalidNamespace(String),

    /// TLS material could not be parsed.
    #[error("invalid TLS material: {0}")]
    Tls(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
