//! Shared harness for runtime integration tests.

use std::sync::Arc;
use std::time::Duration;

use keel_state::{ResourceType, Store, Typed};
use serde::Serialize;

/// Input resource driven by tests.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Desired {
    pub items: Vec<String>,
}

impl ResourceType for Desired {
    const TYPE: &'static str = "Desireds.test.keel.dev";
    const NAMESPACE: &'static str = "test";
}

/// Output resource produced by test controllers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Item {
    pub name: String,
}

impl ResourceType for Item {
    const TYPE: &'static str = "Items.test.keel.dev";
    const NAMESPACE: &'static str = "test";
}

pub fn new_store() -> Arc<Store> {
    let store = Store::new();
    store.register::<Desired>();
    store.register::<Item>();
    Arc::new(store)
}

/// Polls `f` until it returns true or the deadline passes.
pub async fn eventually<F: FnMut() -> bool>(mut f: F) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn ids<T: ResourceType>(items: &[Typed<T>]) -> Vec<String> {
    items.iter().map(|i| i.id().to_string()).collect()
}
