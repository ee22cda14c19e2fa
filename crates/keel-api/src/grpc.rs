//! Helpers shared by the hand-maintained gRPC services.

use std::str::FromStr;

use tonic::codegen::{empty_body, http, BoxFuture};
use tonic::transport::{Channel, Endpoint};

use crate::error::{ApiError, Result};

/// Response for unknown or unauthorized methods.
pub(crate) fn unimplemented<E: Send + 'static>() -> BoxFuture<http::Response<tonic::body::BoxBody>, E> {
    Box::pin(async move {
        let mut response = http::Response::new(empty_body());
        let headers = response.headers_mut();
        headers.insert(tonic::Status::GRPC_STATUS, (tonic::Code::Unimplemented as i32).into());
        headers.insert(http::header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);
        Ok(response)
    })
}

/// Maps a readiness failure of the underlying channel to a status.
pub(crate) fn not_ready(err: tonic::transport::Error) -> tonic::Status {
    tonic::Status::unknown(format!("service was not ready: {err}"))
}

/// Parses `host:port` or a full URI into a plain-text endpoint.
pub(crate) fn endpoint(addr: &str) -> Result<Endpoint> {
    let uri = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };

    Endpoint::from_str(&uri).map_err(|_| ApiError::InvalidEndpoint(addr.to_string()))
}

/// Connects a plain-text channel.
pub(crate) async fn connect(addr: &str) -> Result<Channel> {
    Ok(endpoint(addr)?.connect().await?)
}
