//! Helpers for controller unit tests.

use std::sync::Arc;

use keel_resources::config::MachineConfig;
use keel_resources::document::MachineConfigDocument;
use keel_runtime::{ControllerRuntime, Output};
use keel_state::{Pointer, Resource, ResourceType, Store};

/// Store with every resource kind registered.
pub fn new_store() -> Arc<Store> {
    let store = Store::new();
    keel_resources::register_all(&store);
    Arc::new(store)
}

/// A standalone handle owning `T` exclusively.
pub fn standalone<T: ResourceType>(name: &str) -> (Arc<Store>, ControllerRuntime) {
    standalone_with(name, vec![Output::exclusive::<T>()])
}

/// A standalone handle with the given outputs.
pub fn standalone_with(name: &str, outputs: Vec<Output>) -> (Arc<Store>, ControllerRuntime) {
    let store = new_store();
    let r = ControllerRuntime::standalone(name, Arc::clone(&store), vec![], outputs);
    (store, r)
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

/// Tears down and destroys an unowned resource.
pub fn remove<T: ResourceType>(store: &Store, id: &str) {
    let ptr = Pointer::new(T::NAMESPACE, T::TYPE, id);
    store.teardown(&ptr, None).unwrap();
    store.destroy(&ptr, None).unwrap();
}

/// Seeds the active machine configuration.
pub fn seed_config(store: &Store, doc: MachineConfigDocument) {
    put(store, MachineConfig::ACTIVE_ID, MachineConfig::new(doc));
}
