//! Maintenance API server lifecycle.
//!
//! The server runs while a [`MaintenanceServiceRequest`] exists. Configuration
//! uploaded through it lands in the store as the `maintenance` machine config,
//! which is destroyed again when the server goes away.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use keel_api::maintenance::{certificate_fingerprint, DEFAULT_ADMIN_NETWORK, SHUTDOWN_GRACE};
use keel_api::proto::machine::{
    ApplyConfigurationRequest, ApplyConfigurationResponse, ApplyMode, MetaDeleteRequest, MetaWriteRequest,
    VersionResponse,
};
use keel_api::proto::Empty;
use keel_api::{MachineService, MaintenanceServer, TlsMaterial};
use keel_resources::config::MachineConfig;
use keel_resources::document::MachineConfigDocument;
use keel_resources::runtime::{MaintenanceServiceConfig, MaintenanceServiceRequest};
use keel_resources::services::MaintenanceServiceCerts;
use keel_runtime::{CancellationToken, Controller, ControllerResult, ControllerRuntime, Input, Output, ResultExt};
use keel_state::{Phase, Pointer, ResourceType};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::sys::meta::MetaStore;

const NAME: &str = "runtime.MaintenanceServiceController";

const DRY_RUN_SUMMARY: &str = "Dry run summary:\nNode is running in maintenance mode and does not have a config yet.";

/// Handles maintenance API calls.
pub struct MaintenanceHandler {
    configs: mpsc::Sender<MachineConfigDocument>,
    meta: Arc<dyn MetaStore>,
}

impl std::fmt::Debug for MaintenanceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceHandler").finish_non_exhaustive()
    }
}

fn meta_key(key: u32) -> Result<u8, Status> {
    u8::try_from(key).map_err(|_| Status::invalid_argument("key must be a uint8"))
}

#[async_trait]
impl MachineService for MaintenanceHandler {
    async fn apply_configuration(
        &self,
        request: Request<ApplyConfigurationRequest>,
    ) -> Result<Response<ApplyConfigurationResponse>, Status> {
        let req = request.into_inner();

        let supported = [ApplyMode::Try, ApplyMode::Reboot, ApplyMode::Auto];
        if !supported.iter().any(|m| *m as i32 == req.mode) {
            return Err(Status::unimplemented(format!(
                "apply configuration mode {} is not supported in maintenance mode",
                req.mode
            )));
        }

        let doc: MachineConfigDocument = serde_yaml::from_slice(&req.data)
            .map_err(|err| Status::invalid_argument(format!("failed to parse config: {err}")))?;

        let mut reply = ApplyConfigurationResponse {
            mode: req.mode,
            mode_details: String::new(),
        };

        if req.dry_run {
            reply.mode_details = DRY_RUN_SUMMARY.to_string();
            return Ok(Response::new(reply));
        }

        self.configs
            .send(doc)
            .await
            .map_err(|_| Status::unavailable("maintenance service is shutting down"))?;

        Ok(Response::new(reply))
    }

    async fn version(&self, _request: Request<Empty>) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            tag: env!("CARGO_PKG_VERSION").to_string(),
            sha: option_env!("KEEL_GIT_SHA").unwrap_or("unknown").to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }))
    }

    async fn meta_write(&self, request: Request<MetaWriteRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let key = meta_key(req.key)?;

        match self.meta.write(key, &req.value) {
            Ok(()) => Ok(Response::new(Empty {})),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {
                Err(Status::resource_exhausted(format!("meta write failed: {err}")))
            }
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn meta_delete(&self, request: Request<MetaDeleteRequest>) -> Result<Response<Empty>, Status> {
        let key = meta_key(request.into_inner().key)?;

        match self.meta.delete(key) {
            Ok(true) => Ok(Response::new(Empty {})),
            Ok(false) => Err(Status::not_found(format!("meta key {key:#04x} not found"))),
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }
}

struct Running {
    server: MaintenanceServer,
    listen_address: String,
    tls: TlsMaterial,
}

/// Runs the maintenance API while it is requested.
pub struct MaintenanceServiceController {
    handler: Arc<MaintenanceHandler>,
    configs: mpsc::Receiver<MachineConfigDocument>,
    admin_networks: Vec<IpNetwork>,
    running: Option<Running>,
    last_reachable: Vec<IpAddr>,
    last_fingerprint: String,
}

impl std::fmt::Debug for MaintenanceServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceServiceController")
            .field("listen_address", &self.running.as_ref().map(|r| r.listen_address.as_str()))
            .field("admin_networks", &self.admin_networks)
            .finish()
    }
}

impl MaintenanceServiceController {
    /// Controller backed by `meta` for meta key calls.
    pub fn new(meta: Arc<dyn MetaStore>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let admin_networks = DEFAULT_ADMIN_NETWORK.parse().map(|net| vec![net]).unwrap_or_default();

        MaintenanceServiceController {
            handler: Arc::new(MaintenanceHandler { configs: tx, meta }),
            configs: rx,
            admin_networks,
            running: None,
            last_reachable: Vec::new(),
            last_fingerprint: String::new(),
        }
    }

    /// Replaces the networks whose peers get admin access.
    pub fn with_admin_networks(mut self, networks: Vec<IpNetwork>) -> Self {
        self.admin_networks = networks;
        self
    }

    /// Address the server is bound to, if running.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.running.as_ref().map(|r| r.server.local_addr())
    }

    /// Stores an uploaded configuration as the maintenance machine config.
    pub fn store_config(&self, r: &mut ControllerRuntime, doc: MachineConfigDocument) -> ControllerResult {
        info!("received machine configuration through the maintenance API");
        r.modify::<MachineConfig, _>(MachineConfig::MAINTENANCE_ID, |cfg| {
            *cfg = MachineConfig::new(doc);
            Ok(())
        })
    }

    async fn shutdown(&mut self, r: &mut ControllerRuntime) {
        if let Some(running) = self.running.take() {
            running.server.stop(SHUTDOWN_GRACE).await;
            debug!(listen_address = %running.listen_address, "maintenance server stopped");
            self.last_reachable.clear();
        }

        let ptr = Pointer::new(MachineConfig::NAMESPACE, MachineConfig::TYPE, MachineConfig::MAINTENANCE_ID);
        if let Err(err) = r.teardown_and_destroy(&ptr) {
            error!(error = %err, "failed to destroy maintenance machine config");
        }
    }

    /// One pass over request, config and certificates.
    pub async fn reconcile(&mut self, r: &mut ControllerRuntime) -> ControllerResult {
        let Some(request) = r.get::<MaintenanceServiceRequest>(MaintenanceServiceRequest::ID)? else {
            self.shutdown(r).await;
            return Ok(());
        };
        let request_ptr = request.metadata.pointer().clone();

        if request.metadata.phase() == Phase::TearingDown {
            self.shutdown(r).await;
            r.remove_finalizer(&request_ptr, NAME)?;
            return Ok(());
        }

        let config = r.get::<MaintenanceServiceConfig>(MaintenanceServiceConfig::ID)?;
        let certs = r.get::<MaintenanceServiceCerts>(MaintenanceServiceCerts::ID)?;

        r.add_finalizer(&request_ptr, NAME)?;

        let Some(config) = config else {
            self.shutdown(r).await;
            return Ok(());
        };
        let Some(certs) = certs else {
            debug!("waiting for maintenance service certificates");
            return Ok(());
        };

        let tls = TlsMaterial {
            cert_pem: certs.spec.server.cert.clone().into_bytes(),
            key_pem: certs.spec.server.key.clone().into_bytes(),
        };

        let restart = self
            .running
            .as_ref()
            .is_some_and(|running| running.listen_address != config.spec.listen_address || running.tls != tls);
        if restart {
            if let Some(running) = self.running.take() {
                running.server.stop(SHUTDOWN_GRACE).await;
                debug!(listen_address = %running.listen_address, "maintenance server stopped for restart");
            }
        }

        if self.running.is_none() {
            let server = MaintenanceServer::start(
                &config.spec.listen_address,
                &tls,
                self.admin_networks.clone(),
                Arc::clone(&self.handler),
            )
            .await
            .with_context(|| format!("starting maintenance server on {}", config.spec.listen_address))?;

            info!(listen_address = %server.local_addr(), "maintenance service started");
            self.running = Some(Running {
                server,
                listen_address: config.spec.listen_address.clone(),
                tls: tls.clone(),
            });
        }

        if self.last_reachable != config.spec.reachable_addresses {
            info!("this machine is reachable at:");
            for addr in &config.spec.reachable_addresses {
                info!("\t{addr}");
            }
            self.last_reachable = config.spec.reachable_addresses.clone();
        }

        let fingerprint = certificate_fingerprint(&tls.cert_pem).context("fingerprinting maintenance certificate")?;
        if fingerprint != self.last_fingerprint {
            info!(%fingerprint, "server certificate issued");
            self.last_fingerprint = fingerprint;
        }

        r.reset_restart_backoff();
        Ok(())
    }

    async fn run_loop(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                Some(doc) = self.configs.recv() => {
                    self.store_config(r, doc)?;
                    continue;
                }
                ev = r.event() => {
                    if ev.is_none() {
                        return Ok(());
                    }
                }
            }

            self.reconcile(r).await?;
        }
    }
}

#[async_trait]
impl Controller for MaintenanceServiceController {
    fn name(&self) -> &str {
        NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<MaintenanceServiceRequest>().with_id(MaintenanceServiceRequest::ID),
            Input::weak::<MaintenanceServiceConfig>().with_id(MaintenanceServiceConfig::ID),
            Input::weak::<MaintenanceServiceCerts>().with_id(MaintenanceServiceCerts::ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared::<MachineConfig>()]
    }

    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult {
        let result = self.run_loop(ctx, r).await;
        self.shutdown(r).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use keel_api::MachineServiceClient;
    use keel_resources::services::CertificateAndKey;

    use crate::sys::meta::FileMeta;
    use crate::testutil::{put, standalone_with};

    fn certs() -> MaintenanceServiceCerts {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let pair = CertificateAndKey {
            cert: ck.cert.pem(),
            key: ck.key_pair.serialize_pem(),
        };
        MaintenanceServiceCerts {
            ca: pair.clone(),
            server: pair,
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn listen(store: &keel_state::Store, port: u16) {
        put(
            store,
            MaintenanceServiceConfig::ID,
            MaintenanceServiceConfig {
                listen_address: format!("127.0.0.1:{port}"),
                reachable_addresses: vec!["10.5.0.2".parse().unwrap()],
            },
        );
    }

    async fn client(port: u16, certs: &MaintenanceServiceCerts) -> MachineServiceClient {
        MachineServiceClient::connect_tls(&format!("127.0.0.1:{port}"), certs.ca.cert.as_bytes(), "localhost")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_listen_address_change_rebinds() {
        let meta_dir = tempfile::tempdir().unwrap();
        let (store, mut r) = standalone_with(NAME, vec![Output::shared::<MachineConfig>()]);
        let certs = certs();
        put(store.as_ref(), MaintenanceServiceCerts::ID, certs.clone());
        put(store.as_ref(), MaintenanceServiceRequest::ID, MaintenanceServiceRequest {});

        let (p1, p2) = (free_port(), free_port());
        listen(&store, p1);

        let mut ctrl = MaintenanceServiceController::new(Arc::new(FileMeta::new(meta_dir.path())));
        ctrl.reconcile(&mut r).await.unwrap();
        assert_eq!(ctrl.local_addr().unwrap().port(), p1);
        client(p1, &certs).await.version().await.unwrap();

        let request = store.get_typed::<MaintenanceServiceRequest>(MaintenanceServiceRequest::ID).unwrap();
        assert!(request.metadata.finalizers().contains(NAME));

        listen(&store, p2);
        ctrl.reconcile(&mut r).await.unwrap();
        assert_eq!(ctrl.local_addr().unwrap().port(), p2);
        client(p2, &certs).await.version().await.unwrap();

        let err = tokio::net::TcpStream::connect(("127.0.0.1", p1)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);

        ctrl.shutdown(&mut r).await;
    }

    #[tokio::test]
    async fn test_uploaded_config_and_teardown() {
        let meta_dir = tempfile::tempdir().unwrap();
        let (store, mut r) = standalone_with(NAME, vec![Output::shared::<MachineConfig>()]);
        let certs = certs();
        put(store.as_ref(), MaintenanceServiceCerts::ID, certs.clone());
        put(store.as_ref(), MaintenanceServiceRequest::ID, MaintenanceServiceRequest {});
        let port = free_port();
        listen(&store, port);

        let mut ctrl = MaintenanceServiceController::new(Arc::new(FileMeta::new(meta_dir.path())));
        ctrl.reconcile(&mut r).await.unwrap();

        let mut c = client(port, &certs).await;

        let dry = c
            .apply_configuration(ApplyConfigurationRequest {
                data: b"machine:\n  type: worker\n".to_vec(),
                mode: ApplyMode::Auto as i32,
                dry_run: true,
            })
            .await
            .unwrap();
        assert!(dry.mode_details.starts_with("Dry run summary"));

        let err = c
            .apply_configuration(ApplyConfigurationRequest {
                data: b"machine: {}\n".to_vec(),
                mode: ApplyMode::Staged as i32,
                dry_run: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);

        c.apply_configuration(ApplyConfigurationRequest {
            data: b"machine:\n  type: worker\n".to_vec(),
            mode: ApplyMode::Auto as i32,
            dry_run: false,
        })
        .await
        .unwrap();

        let doc = tokio::time::timeout(Duration::from_secs(5), ctrl.configs.recv())
            .await
            .unwrap()
            .unwrap();
        ctrl.store_config(&mut r, doc).unwrap();
        assert!(store.get_typed::<MachineConfig>(MachineConfig::MAINTENANCE_ID).is_ok());

        // readers can't touch meta keys
        let err = c
            .meta_write(MetaWriteRequest {
                key: 0x0c,
                value: b"A".to_vec(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);
        drop(c);

        let ptr = Pointer::new(
            MaintenanceServiceRequest::NAMESPACE,
            MaintenanceServiceRequest::TYPE,
            MaintenanceServiceRequest::ID,
        );
        store.teardown(&ptr, None).unwrap();
        ctrl.reconcile(&mut r).await.unwrap();

        assert!(ctrl.local_addr().is_none());
        assert!(store.get_typed::<MachineConfig>(MachineConfig::MAINTENANCE_ID).is_err());
        store.destroy(&ptr, None).unwrap();

        let err = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_meta_calls() {
        let meta_dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(FileMeta::new(meta_dir.path()));
        let (tx, _rx) = mpsc::channel(1);
        let handler = MaintenanceHandler {
            configs: tx,
            meta: meta.clone(),
        };

        let err = handler
            .meta_write(Request::new(MetaWriteRequest {
                key: 300,
                value: vec![],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        handler
            .meta_write(Request::new(MetaWriteRequest {
                key: 0x0c,
                value: b"A".to_vec(),
            }))
            .await
            .unwrap();
        assert_eq!(meta.read(0x0c).unwrap().unwrap(), b"A");

        handler
            .meta_delete(Request::new(MetaDeleteRequest { key: 0x0c }))
            .await
            .unwrap();
        let err = handler
            .meta_delete(Request::new(MetaDeleteRequest { key: 0x0c }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
