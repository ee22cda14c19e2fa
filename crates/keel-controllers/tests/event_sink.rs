//! Event forwarding against real sink servers.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, new_store, put, Running};
use keel_api::proto::events::{EventRequest, EventResponse, TaskEvent};
use keel_api::{EventPayload, EventSink, EventSinkServer};
use keel_controllers::logging::EventsSinkController;
use keel_resources::runtime::EventSinkConfig;
use keel_resources::services::NetworkStatus;
use keel_runtime::{DrainState, Drainer, EventStream, Runtime};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::{Request, Response, Status};

#[derive(Default)]
struct RecordingSink {
    ids: Mutex<Vec<String>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, request: Request<EventRequest>) -> Result<Response<EventResponse>, Status> {
        self.ids.lock().push(request.into_inner().id);
        Ok(Response::new(EventResponse {}))
    }
}

async fn serve() -> (Arc<RecordingSink>, SocketAddr) {
    let sink = Arc::new(RecordingSink::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpIncoming::from_listener(listener, true, None).unwrap();
    let server = tonic::transport::Server::builder().add_service(EventSinkServer::from_arc(Arc::clone(&sink)));
    tokio::spawn(server.serve_with_incoming(incoming));
    (sink, addr)
}

fn task(name: &str) -> EventPayload {
    EventPayload::Task(TaskEvent {
        task: name.into(),
        action: 0,
    })
}

#[tokio::test]
async fn test_forwards_resumes_and_drains() {
    let (first, first_addr) = serve().await;
    let (second, second_addr) = serve().await;

    let store = new_store();
    let events = EventStream::new(100);
    let drainer = Drainer::new();

    let a = events.publish(task("a"));
    let b = events.publish(task("b"));

    let mut runtime = Runtime::new(store.clone());
    runtime
        .register(EventsSinkController::new(events.clone(), drainer.clone()))
        .unwrap();
    let running = Running::start(runtime);

    put(
        &store,
        EventSinkConfig::ID,
        EventSinkConfig {
            endpoint: first_addr.to_string(),
        },
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(first.ids.lock().is_empty(), "nothing is sent before the node has an address");

    put(
        &store,
        NetworkStatus::ID,
        NetworkStatus {
            address_ready: true,
            ..Default::default()
        },
    );
    assert!(eventually(|| *first.ids.lock() == vec![a.clone(), b.clone()]).await);

    put(
        &store,
        EventSinkConfig::ID,
        EventSinkConfig {
            endpoint: second_addr.to_string(),
        },
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let c = events.publish(task("c"));
    assert!(eventually(|| *second.ids.lock() == vec![c.clone()]).await);
    assert_eq!(first.ids.lock().len(), 2);

    let d = events.publish(task("d"));
    assert_eq!(drainer.drain(Duration::from_secs(5)).await, DrainState::Drained);
    assert_eq!(*second.ids.lock(), vec![c, d]);

    running.stop().await;
}
