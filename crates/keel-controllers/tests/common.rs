//! Shared harness for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_resources::config::MachineConfig;
use keel_resources::document::MachineConfigDocument;
use keel_runtime::{CancellationToken, Runtime, RuntimeError};
use keel_state::{Pointer, Resource, ResourceType, Store};
use tokio::task::JoinHandle;

/// Store with every resource kind registered.
pub fn new_store() -> Arc<Store> {
    let store = Store::new();
    keel_resources::register_all(&store);
    Arc::new(store)
}

/// Creates or replaces an unowned resource.
pub fn put<T: ResourceType>(store: &Store, id: &str, spec: T) {
    let ptr = Pointer::new(T::NAMESPACE, T::TYPE, id);
    match store.get(&ptr) {
        Ok(mut current) => {
            current.set_spec(spec);
            store.update(current).unwrap();
        }
        Err(_) => {
            store.create(Resource::new(id, spec)).unwrap();
        }
    }
}

/// Replaces the active machine configuration.
pub fn apply_config(store: &Store, doc: MachineConfigDocument) {
    put(store, MachineConfig::ACTIVE_ID, MachineConfig::new(doc));
}

/// A runtime running in the background.
pub struct Running {
    pub ctx: CancellationToken,
    pub handle: JoinHandle<Result<(), RuntimeError>>,
}

impl Running {
    pub fn start(runtime: Runtime) -> Self {
        let ctx = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(ctx.clone()));
        Running { ctx, handle }
    }

    pub async fn stop(self) {
        self.ctx.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

/// Polls `f` until it returns true or the deadline passes.
pub async fn eventually<F: FnMut() -> bool>(mut f: F) -> bool {
    for _ in 0..300 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
