//! Maintenance API: `machine.MachineService` over TLS with role-based authorization.
//!
//! Peers whose address falls in one of the admin networks get [`Role::Admin`];
//! everyone else is a [`Role::Reader`]. Readers may only apply configuration;
//! admin-only methods answer them with `Unimplemented`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::codegen::{http, Body, BoxFuture, StdError};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::server::TcpIncoming;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::error::{ApiError, Result};
use crate::grpc;
use crate::proto::machine::{
    ApplyConfigurationRequest, ApplyConfigurationResponse, MetaDeleteRequest, MetaWriteRequest, VersionResponse,
};
use crate::proto::Empty;

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "machine.MachineService";

/// Grace period for in-flight requests on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default admin network (the cluster link overlay).
pub const DEFAULT_ADMIN_NETWORK: &str = "fdae:41e4:649b:9303::/64";

const APPLY_CONFIGURATION_PATH: &str = "/machine.MachineService/ApplyConfiguration";
const VERSION_PATH: &str = "/machine.MachineService/Version";
const META_WRITE_PATH: &str = "/machine.MachineService/MetaWrite";
const META_DELETE_PATH: &str = "/machine.MachineService/MetaDelete";

/// Caller role derived from the peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Read-only access: configuration can be applied, nothing else.
    Reader,
    /// Full access.
    Admin,
}

/// Returns the role a peer gets given the admin networks.
pub fn role_for(peer: Option<SocketAddr>, admin_networks: &[IpNetwork]) -> Role {
    match peer {
        Some(addr) if admin_networks.iter().any(|net| net.contains(addr.ip())) => Role::Admin,
        _ => Role::Reader,
    }
}

/// Interceptor which tags each request with the caller [`Role`].
pub fn authorizer(
    admin_networks: Vec<IpNetwork>,
) -> impl FnMut(Request<()>) -> std::result::Result<Request<()>, Status> + Clone {
    move |mut req: Request<()>| {
        let role = role_for(req.remote_addr(), &admin_networks);
        req.extensions_mut().insert(role);
        Ok(req)
    }
}

/// Server-side handler of the maintenance API.
#[async_trait]
pub trait MachineService: Send + Sync + 'static {
    /// Accepts a machine configuration.
    async fn apply_configuration(
        &self,
        request: Request<ApplyConfigurationRequest>,
    ) -> std::result::Result<Response<ApplyConfigurationResponse>, Status>;

    /// Reports the software version.
    async fn version(&self, request: Request<Empty>) -> std::result::Result<Response<VersionResponse>, Status>;

    /// Writes a meta key.
    async fn meta_write(&self, request: Request<MetaWriteRequest>) -> std::result::Result<Response<Empty>, Status>;

    /// Deletes a meta key.
    async fn meta_delete(&self, request: Request<MetaDeleteRequest>) -> std::result::Result<Response<Empty>, Status>;
}

/// gRPC service wrapping a [`MachineService`].
#[derive(Debug)]
pub struct MachineServiceServer<T> {
    inner: Arc<T>,
}

impl<T: MachineService> MachineServiceServer<T> {
    /// Wraps a handler.
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    /// Wraps a shared handler.
    pub fn from_arc(inner: Arc<T>) -> Self {
        MachineServiceServer { inner }
    }
}

impl<T> Clone for MachineServiceServer<T> {
    fn clone(&self) -> Self {
        MachineServiceServer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> tonic::server::NamedService for MachineServiceServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}

struct ApplyConfigurationSvc<T>(Arc<T>);

impl<T: MachineService> tonic::server::UnaryService<ApplyConfigurationRequest> for ApplyConfigurationSvc<T> {
    type Response = ApplyConfigurationResponse;
    type Future = BoxFuture<Response<ApplyConfigurationResponse>, Status>;

    fn call(&mut self, request: Request<ApplyConfigurationRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.apply_configuration(request).await })
    }
}

struct VersionSvc<T>(Arc<T>);

impl<T: MachineService> tonic::server::UnaryService<Empty> for VersionSvc<T> {
    type Response = VersionResponse;
    type Future = BoxFuture<Response<VersionResponse>, Status>;

    fn call(&mut self, request: Request<Empty>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.version(request).await })
    }
}

struct MetaWriteSvc<T>(Arc<T>);

impl<T: MachineService> tonic::server::UnaryService<MetaWriteRequest> for MetaWriteSvc<T> {
    type Response = Empty;
    type Future = BoxFuture<Response<Empty>, Status>;

    fn call(&mut self, request: Request<MetaWriteRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.meta_write(request).await })
    }
}

struct MetaDeleteSvc<T>(Arc<T>);

impl<T: MachineService> tonic::server::UnaryService<MetaDeleteRequest> for MetaDeleteSvc<T> {
    type Response = Empty;
    type Future = BoxFuture<Response<Empty>, Status>;

    fn call(&mut self, request: Request<MetaDeleteRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.meta_delete(request).await })
    }
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for MachineServiceServer<T>
where
    T: MachineService,
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
        let role = req.extensions().get::<Role>().copied().unwrap_or(Role::Reader);
        let inner = Arc::clone(&self.inner);

        match (req.uri().path(), role) {
            (APPLY_CONFIGURATION_PATH, _) => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(ApplyConfigurationSvc(inner), req).await)
            }),
            (VERSION_PATH, Role::Admin) => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(VersionSvc(inner), req).await)
            }),
            (META_WRITE_PATH, Role::Admin) => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(MetaWriteSvc(inner), req).await)
            }),
            (META_DELETE_PATH, Role::Admin) => Box::pin(async move {
                let mut grpc = tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                Ok(grpc.unary(MetaDeleteSvc(inner), req).await)
            }),
            (path, role) => {
                debug!(path, ?role, "rejecting maintenance call");
                grpc::unimplemented()
            }
        }
    }
}

/// PEM encoded server certificate and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Certificate chain.
    pub cert_pem: Vec<u8>,
    /// Private key.
    pub key_pem: Vec<u8>,
}

/// SHA-256 fingerprint of the first certificate in a PEM bundle, hex encoded.
pub fn certificate_fingerprint(cert_pem: &[u8]) -> Result<String> {
    let mut reader = cert_pem;
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| ApiError::Tls("no certificate in PEM bundle".to_string()))??;

    Ok(hex::encode(Sha256::digest(der.as_ref())))
}

/// A running maintenance server.
#[derive(Debug)]
pub struct MaintenanceServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MaintenanceServer {
    /// Binds `listen_addr` and serves `service` over TLS.
    ///
    /// The listener is bound before returning, so connections are accepted as
    /// soon as this resolves.
    pub async fn start<T: MachineService>(
        listen_addr: &str,
        tls: &TlsMaterial,
        admin_networks: Vec<IpNetwork>,
        service: Arc<T>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let incoming = TcpIncoming::from_listener(listener, true, None).map_err(std::io::Error::other)?;

        let identity = Identity::from_pem(&tls.cert_pem, &tls.key_pem);
        let svc = InterceptedService::new(MachineServiceServer::from_arc(service), authorizer(admin_networks));

        let router = tonic::transport::Server::builder()
            .tls_config(ServerTlsConfig::new().identity(identity))?
            .add_service(svc);

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            router
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = rx.await;
                })
                .await?;
            Ok::<(), ApiError>(())
        });

        debug!(%local_addr, "maintenance server started");

        Ok(MaintenanceServer {
            local_addr,
            shutdown: Some(tx),
            task,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits up to `grace` for in-flight
    /// requests; the server is aborted after that.
    pub async fn stop(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(error = %err, "maintenance server exited with error"),
            Ok(Err(err)) => warn!(error = %err, "maintenance server task failed"),
            Err(_) => {
                warn!(?grace, "maintenance server didn't stop in time, aborting");
                self.task.abort();
                let _ = (&mut self.task).await;
            }
        }
    }
}

/// Client of the maintenance API.
#[derive(Debug, Clone)]
pub struct MachineServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl MachineServiceClient {
    /// Connects over TLS, trusting `ca_pem` and verifying the server as `domain`.
    pub async fn connect_tls(addr: &str, ca_pem: &[u8], domain: &str) -> Result<Self> {
        let endpoint = grpc::endpoint(&format!("https://{addr}"))?.tls_config(
            ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(ca_pem))
                .domain_name(domain),
        )?;

        Ok(Self::new(endpoint.connect().await?))
    }

    /// Wraps an established channel.
    pub fn new(channel: Channel) -> Self {
        MachineServiceClient {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    async fn call<M1, M2>(&mut self, path: &'static str, method: &'static str, msg: M1) -> std::result::Result<M2, Status>
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner.ready().await.map_err(grpc::not_ready)?;

        let mut req = Request::new(msg);
        req.extensions_mut().insert(tonic::GrpcMethod::new(SERVICE_NAME, method));

        let codec = tonic::codec::ProstCodec::default();
        let resp = self
            .inner
            .unary(req, http::uri::PathAndQuery::from_static(path), codec)
            .await?;

        Ok(resp.into_inner())
    }

    /// Applies a configuration.
    pub async fn apply_configuration(
        &mut self,
        req: ApplyConfigurationRequest,
    ) -> std::result::Result<ApplyConfigurationResponse, Status> {
        self.call(APPLY_CONFIGURATION_PATH, "ApplyConfiguration", req).await
    }

    /// Queries the version.
    pub async fn version(&mut self) -> std::result::Result<VersionResponse, Status> {
        self.call(VERSION_PATH, "Version", Empty {}).await
    }

    /// Writes a meta key.
    pub async fn meta_write(&mut self, req: MetaWriteRequest) -> std::result::Result<(), Status> {
        self.call::<_, Empty>(META_WRITE_PATH, "MetaWrite", req).await.map(|_| ())
    }

    /// Deletes a meta key.
    pub async fn meta_delete(&mut self, req: MetaDeleteRequest) -> std::result::Result<(), Status> {
        self.call::<_, Empty>(META_DELETE_PATH, "MetaDelete", req).await.map(|_| ())
    }
}
