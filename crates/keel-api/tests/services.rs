//! Event sink and maintenance API over real sockets.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use keel_api::codec::EventPayload;
use keel_api::maintenance::{certificate_fingerprint, SHUTDOWN_GRACE};
use keel_api::proto::events::{EventRequest, EventResponse, TaskEvent};
use keel_api::proto::machine::{
    ApplyConfigurationRequest, ApplyConfigurationResponse, ApplyMode, MetaDeleteRequest, MetaWriteRequest,
    VersionResponse,
};
use keel_api::proto::Empty;
use keel_api::{EventSink, EventSinkClient, EventSinkServer, MachineService, MachineServiceClient, MaintenanceServer};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::{Code, Request, Response, Status};

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<EventRequest>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, request: Request<EventRequest>) -> Result<Response<EventResponse>, Status> {
        self.received.lock().push(request.into_inner());
        Ok(Response::new(EventResponse {}))
    }
}

#[tokio::test]
async fn test_event_sink_round_trip() {
    let sink = Arc::new(RecordingSink::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpIncoming::from_listener(listener, true, None).unwrap();

    let server = tonic::transport::Server::builder().add_service(EventSinkServer::from_arc(Arc::clone(&sink)));
    tokio::spawn(server.serve_with_incoming(incoming));

    let mut client = EventSinkClient::connect(&addr.to_string()).await.unwrap();
    let payload = EventPayload::Task(TaskEvent {
        task: "runningMaintenance".to_string(),
        action: 0,
    });

    client
        .publish(EventRequest {
            id: "event-1".to_string(),
            data: Some(payload.to_any()),
            actor_id: "actor".to_string(),
        })
        .await
        .unwrap();

    let received = sink.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, "event-1");
    assert_eq!(EventPayload::from_any(received[0].data.as_ref().unwrap()).unwrap(), payload);
}

#[derive(Default)]
struct FakeMachine {
    applied: Mutex<Vec<Vec<u8>>>,
    meta: Mutex<Vec<u32>>,
}

#[async_trait]
impl MachineService for FakeMachine {
    async fn apply_configuration(
        &self,
        request: Request<ApplyConfigurationRequest>,
    ) -> Result<Response<ApplyConfigurationResponse>, Status> {
        let req = request.into_inner();
        self.applied.lock().push(req.data);
        Ok(Response::new(ApplyConfigurationResponse {
            mode: req.mode,
            mode_details: "applied".to_string(),
        }))
    }

    async fn version(&self, _request: Request<Empty>) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            tag: "v0.1.0".to_string(),
            sha: "abc".to_string(),
            arch: "amd64".to_string(),
        }))
    }

    async fn meta_write(&self, request: Request<MetaWriteRequest>) -> Result<Response<Empty>, Status> {
        self.meta.lock().push(request.into_inner().key);
        Ok(Response::new(Empty {}))
    }

    async fn meta_delete(&self, request: Request<MetaDeleteRequest>) -> Result<Response<Empty>, Status> {
        self.meta.lock().retain(|k| *k != request.get_ref().key);
        Ok(Response::new(Empty {}))
    }
}

#[tokio::test]
async fn test_maintenance_reader_cannot_call_admin_methods() {
    let tls = common::self_signed();
    let machine = Arc::new(FakeMachine::default());
    let admin: Vec<IpNetwork> = vec![keel_api::maintenance::DEFAULT_ADMIN_NETWORK.parse().unwrap()];

    let server = MaintenanceServer::start("127.0.0.1:0", &tls, admin, Arc::clone(&machine))
        .await
        .unwrap();
    let addr = server.local_addr().to_string();

    let mut client = MachineServiceClient::connect_tls(&addr, &tls.cert_pem, "localhost")
        .await
        .unwrap();

    let resp = client
        .apply_configuration(ApplyConfigurationRequest {
            data: b"version: v1alpha1\n".to_vec(),
            mode: ApplyMode::Auto as i32,
            dry_run: false,
        })
        .await
        .unwrap();
    assert_eq!(resp.mode(), ApplyMode::Auto);
    assert_eq!(machine.applied.lock().len(), 1);

    let err = client.version().await.unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let err = client
        .meta_write(MetaWriteRequest {
            key: 0x0c,
            value: vec![1],
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
    assert!(machine.meta.lock().is_empty());

    drop(client);
    server.stop(SHUTDOWN_GRACE).await;
}

#[tokio::test]
async fn test_maintenance_admin_network() {
    let tls = common::self_signed();
    let machine = Arc::new(FakeMachine::default());
    let admin: Vec<IpNetwork> = vec!["127.0.0.0/8".parse().unwrap()];

    let server = MaintenanceServer::start("127.0.0.1:0", &tls, admin, Arc::clone(&machine))
        .await
        .unwrap();
    let addr = server.local_addr().to_string();

    let mut client = MachineServiceClient::connect_tls(&addr, &tls.cert_pem, "localhost")
        .await
        .unwrap();

    assert_eq!(client.version().await.unwrap().tag, "v0.1.0");
    client
        .meta_write(MetaWriteRequest {
            key: 0x0c,
            value: vec![1],
        })
        .await
        .unwrap();
    assert_eq!(*machine.meta.lock(), vec![0x0c]);

    client.meta_delete(MetaDeleteRequest { key: 0x0c }).await.unwrap();
    assert!(machine.meta.lock().is_empty());

    drop(client);
    server.stop(SHUTDOWN_GRACE).await;
}

#[tokio::test]
async fn test_maintenance_stop_closes_listener() {
    let tls = common::self_signed();
    let server = MaintenanceServer::start("127.0.0.1:0", &tls, vec![], Arc::new(FakeMachine::default()))
        .await
        .unwrap();
    let addr = server.local_addr();

    server.stop(Duration::from_secs(1)).await;

    let err = tokio::net::TcpStream::connect(addr).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
}

#[test]
fn test_certificate_fingerprint_matches_der() {
    let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let expected = hex::encode(Sha256::digest(ck.cert.der().as_ref()));

    assert_eq!(certificate_fingerprint(ck.cert.pem().as_bytes()).unwrap(), expected);
    assert_eq!(expected.len(), 64);
}
