//! Event sink service: `sink.EventSinkService/Publish`.
//!
//! The client forwards machine events over plain-text gRPC; the server side
//! is used by collectors and tests.

use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tonic::codegen::{http, Body, BoxFuture, StdError};
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use crate::error::Result;
use crate::grpc;
use crate::proto::events::{EventRequest, EventResponse};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "sink.EventSinkService";

const PUBLISH_PATH: &str = "/sink.EventSinkService/Publish";

/// Client for a remote event sink.
#[derive(Debug, Clone)]
pub struct EventSinkClient {
    inner: tonic::client::Grpc<Channel>,
}

impl EventSinkClient {
    /// Connects to `host:port` over plain-text gRPC.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        Ok(Self::new(grpc::connect(endpoint).await?))
    }

    /// Wraps an established channel.
    pub fn new(channel: Channel) -> Self {
        EventSinkClient {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Sends one event; the sink acknowledges it by returning successfully.
    pub async fn publish(&mut self, request: EventRequest) -> std::result::Result<Response<EventResponse>, Status> {
        self.inner.ready().await.map_err(grpc::not_ready)?;

        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(PUBLISH_PATH);
        let mut req = Request::new(request);
        req.extensions_mut()
            .insert(tonic::GrpcMethod::new(SERVICE_NAME, "Publish"));

        self.inner.unary(req, path, codec).await
    }
}

/// Server-side handler of the event sink service.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Accepts one event.
    async fn publish(&self, request: Request<EventRequest>) -> std::result::Result<Response<EventResponse>, Status>;
}

/// gRPC service wrapping an [`EventSink`].
#[derive(Debug)]
pub struct EventSinkServer<T> {
    inner: Arc<T>,
}

impl<T: EventSink> EventSinkServer<T> {
    /// Wraps a handler.
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    /// Wraps a shared handler.
    pub fn from_arc(inner: Arc<T>) -> Self {
        EventSinkServer { inner }
    }
}

impl<T> Clone for EventSinkServer<T> {
    fn clone(&self) -> Self {
        EventSinkServer {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PublishSvc<T>(Arc<T>);

impl<T: EventSink> tonic::server::UnaryService<EventRequest> for PublishSvc<T> {
    type Response = EventResponse;
    type Future = BoxFuture<Response<EventResponse>, Status>;

    fn call(&mut self, request: Request<EventRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.publish(request).await })
    }
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for EventSinkServer<T>
where
    T: EventSink,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            PUBLISH_PATH => {
                let inner = Arc::clone(&self.inner);
                Box::pin(async move {
                    let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                    Ok(grpc.unary(PublishSvc(inner), req).await)
                })
            }
            _ => grpc::unimplemented(),
        }
    }
}

impl<T> tonic::server::NamedService for EventSinkServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}
