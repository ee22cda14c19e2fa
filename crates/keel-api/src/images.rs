//! Container runtime image service client (`containerd.services.images.v1.Images`).
//!
//! Connects over the runtime's unix socket; every call carries the runtime
//! namespace in the `containerd-namespace` header.

use std::path::{Path, PathBuf};

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::codegen::http;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

use crate::error::{ApiError, Result};
use crate::grpc;
use crate::proto::images::{DeleteImageRequest, Image, ListImagesRequest, ListImagesResponse};
use crate::proto::Empty;

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "containerd.services.images.v1.Images";

/// Namespace used by the CRI plugin.
pub const CRI_NAMESPACE: &str = "k8s.io";

/// Namespace used by system containers.
pub const SYSTEM_NAMESPACE: &str = "system";

const NAMESPACE_HEADER: &str = "containerd-namespace";
const LIST_PATH: &str = "/containerd.services.images.v1.Images/List";
const DELETE_PATH: &str = "/containerd.services.images.v1.Images/Delete";

/// Image service client bound to one namespace.
#[derive(Debug, Clone)]
pub struct ImagesClient {
    inner: tonic::client::Grpc<Channel>,
    namespace: MetadataValue<Ascii>,
}

impl ImagesClient {
    /// Connects to the runtime socket at `path`.
    pub async fn connect_unix(path: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();

        // The URI is required by the endpoint but never dialed.
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_with_connector(tower::service_fn(move |_: http::Uri| {
                let path = path.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
            }))
            .await?;

        Self::new(channel, namespace)
    }

    /// Wraps an established channel.
    pub fn new(channel: Channel, namespace: &str) -> Result<Self> {
        let namespace = namespace
            .parse()
            .map_err(|_| ApiError::InvalidNamespace(namespace.to_string()))?;

        Ok(ImagesClient {
            inner: tonic::client::Grpc::new(channel),
            namespace,
        })
    }

    fn request<M>(&self, msg: M, method: &'static str) -> Request<M> {
        let mut req = Request::new(msg);
        req.metadata_mut().insert(NAMESPACE_HEADER, self.namespace.clone());
        req.extensions_mut().insert(tonic::GrpcMethod::new(SERVICE_NAME, method));
        req
    }

    /// Lists every image in the namespace.
    pub async fn list(&mut self) -> std::result::Result<Vec<Image>, Status> {
        self.inner.ready().await.map_err(grpc::not_ready)?;

        let req = self.request(ListImagesRequest::default(), "List");
        let resp: tonic::Response<ListImagesResponse> = self
            .inner
            .unary(req, http::uri::PathAndQuery::from_static(LIST_PATH), tonic::codec::ProstCodec::default())
            .await?;

        Ok(resp.into_inner().images)
    }

    /// Deletes an image by name.
    pub async fn delete(&mut self, name: &str) -> std::result::Result<(), Status> {
        self.inner.ready().await.map_err(grpc::not_ready)?;

        let req = self.request(
            DeleteImageRequest {
                name: name.to_string(),
                sync: false,
            },
            "Delete",
        );
        let _: tonic::Response<Empty> = self
            .inner
            .unary(req, http::uri::PathAndQuery::from_static(DELETE_PATH), tonic::codec::ProstCodec::default())
            .await?;

        Ok(())
    }
}
