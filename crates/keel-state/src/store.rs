//! In-memory resource store.
//!
//! Resources are grouped into buckets per [`Kind`]; each bucket has its own
//! lock, so writers of different kinds never contend. Watch subscriptions are
//! fed while the bucket lock is held, which gives every watcher the mutation
//! order applied by the store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, StateError};
use crate::metadata::{Kind, LabelQuery, Phase, Pointer, Version};
use crate::resource::{Resource, ResourceType, Typed};
use crate::watch::{Event, WatchScope, Watcher};

type Bucket = BTreeMap<String, Resource>;

struct Subscription {
    scope: WatchScope,
    tx: mpsc::UnboundedSender<Event>,
}

/// The resource store.
#[derive(Default)]
pub struct Store {
    buckets: DashMap<Kind, Arc<RwLock<Bucket>>>,
    types: RwLock<BTreeSet<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource type as defined.
    pub fn register<T: ResourceType>(&self) {
        self.register_type(T::TYPE);
    }

    /// Registers a resource type by name.
    pub fn register_type(&self, res_type: &str) {
        self.types.write().insert(res_type.to_string());
    }

    /// Checks whether a type has been registered.
    pub fn is_registered(&self, res_type: &str) -> bool {
        self.types.read().contains(res_type)
    }

    /// Lists registered types.
    pub fn registered_types(&self) -> Vec<String> {
        self.types.read().iter().cloned().collect()
    }

    fn bucket(&self, kind: &Kind) -> Arc<RwLock<Bucket>> {
        if let Some(bucket) = self.buckets.get(kind) {
            return Arc::clone(bucket.value());
        }
        let entry = self.buckets.entry(kind.clone()).or_default();
        Arc::clone(entry.value())
    }

    fn emit(&self, event: Event) {
        let mut subs = self.subscriptions.lock();
        subs.retain(|sub| {
            if sub.scope.matches_event(&event) {
                sub.tx.send(event.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
    }

    fn check_owner(ptr: &Pointer, stored: Option<&str>, caller: Option<&str>) -> Result<()> {
        if stored != caller {
            return Err(StateError::OwnerMismatch {
                pointer: ptr.clone(),
                owner: stored.map(str::to_string),
                caller: caller.map(str::to_string),
            });
        }
        Ok(())
    }

    /// Creates a resource; the owner recorded in its metadata is kept.
    pub fn create(&self, mut resource: Resource) -> Result<Resource> {
        let ptr = resource.metadata().pointer().clone();
        let bucket = self.bucket(&ptr.kind());
        let mut items = bucket.write();

        if items.contains_key(&ptr.id) {
            return Err(StateError::AlreadyExists(ptr));
        }

        let md = resource.metadata_mut();
        md.set_version(Version::new(1));
        md.set_phase(Phase::Running);
        md.finalizers_mut().clear();
        md.reset_created();

        items.insert(ptr.id.clone(), resource.clone());
        trace!(resource = %ptr, "created");
        self.emit(Event::created(resource.clone()));

        Ok(resource)
    }

    /// Updates a resource.
    ///
    /// The supplied version must match the stored one and the supplied owner
    /// must be the recorded owner. Phase and finalizers are preserved.
    pub fn update(&self, mut resource: Resource) -> Result<Resource> {
        let ptr = resource.metadata().pointer().clone();
        let bucket = self.bucket(&ptr.kind());
        let mut items = bucket.write();

        let stored = items.get(&ptr.id).ok_or_else(|| StateError::NotFound(ptr.clone()))?;

        if resource.metadata().version() != stored.metadata().version() {
            return Err(StateError::VersionConflict {
                pointer: ptr,
                expected: resource.metadata().version(),
                found: stored.metadata().version(),
            });
        }
        Self::check_owner(&ptr, stored.metadata().owner(), resource.metadata().owner())?;

        let old = stored.clone();
        let md = resource.metadata_mut();
        md.inherit(old.metadata());
        md.touch();

        items.insert(ptr.id.clone(), resource.clone());
        trace!(resource = %ptr, version = %resource.metadata().version(), "updated");
        self.emit(Event::updated(old, resource.clone()));

        Ok(resource)
    }

    /// Moves a resource to `TearingDown`; idempotent. Returns the current finalizers.
    pub fn teardown(&self, ptr: &Pointer, owner: Option<&str>) -> Result<BTreeSet<String>> {
        let bucket = self.bucket(&ptr.kind());
        let mut items = bucket.write();

        let stored = items.get(&ptr.id).ok_or_else(|| StateError::NotFound(ptr.clone()))?;
        Self::check_owner(ptr, stored.metadata().owner(), owner)?;

        if stored.metadata().phase() == Phase::TearingDown {
            return Ok(stored.metadata().finalizers().clone());
        }

        let old = stored.clone();
        let mut new = old.clone();
        new.metadata_mut().set_phase(Phase::TearingDown);
        new.metadata_mut().touch();
        let finalizers = new.metadata().finalizers().clone();

        items.insert(ptr.id.clone(), new.clone());
        trace!(resource = %ptr, "tearing down");
        self.emit(Event::updated(old, new));

        Ok(finalizers)
    }

    /// Removes a torn down resource with no finalizers.
    pub fn destroy(&self, ptr: &Pointer, owner: Option<&str>) -> Result<()> {
        let bucket = self.bucket(&ptr.kind());
        let mut items = bucket.write();

        let stored = items.get(&ptr.id).ok_or_else(|| StateError::NotFound(ptr.clone()))?;
        Self::check_owner(ptr, stored.metadata().owner(), owner)?;

        if stored.metadata().phase() != Phase::TearingDown {
            return Err(StateError::NotTearingDown(ptr.clone()));
        }

        if !stored.metadata().finalizers().is_empty() {
            return Err(StateError::HasFinalizers {
                pointer: ptr.clone(),
                finalizers: stored.metadata().finalizers().iter().cloned().collect(),
            });
        }

        if let Some(old) = items.remove(&ptr.id) {
            trace!(resource = %ptr, "destroyed");
            self.emit(Event::destroyed(old));
        }

        Ok(())
    }

    /// Adds a finalizer; a finalizer which is already present is a no-op.
    pub fn add_finalizer(&self, ptr: &Pointer, name: &str) -> Result<()> {
        self.modify_finalizers(ptr, |md_phase, finalizers| {
            if finalizers.contains(name) {
                return Ok(false);
            }
            if md_phase == Phase::TearingDown {
                return Err(StateError::PhaseConflict {
                    pointer: ptr.clone(),
                    phase: md_phase,
                });
            }
            finalizers.insert(name.to_string());
            Ok(true)
        })
    }

    /// Removes a finalizer; a finalizer which is absent is a no-op.
    pub fn remove_finalizer(&self, ptr: &Pointer, name: &str) -> Result<()> {
        self.modify_finalizers(ptr, |_, finalizers| Ok(finalizers.remove(name)))
    }

    fn modify_finalizers<F>(&self, ptr: &Pointer, f: F) -> Result<()>
    where
        F: FnOnce(Phase, &mut BTreeSet<String>) -> Result<bool>,
    {
        let bucket = self.bucket(&ptr.kind());
        let mut items = bucket.write();

        let stored = items.get(&ptr.id).ok_or_else(|| StateError::NotFound(ptr.clone()))?;
        let old = stored.clone();
        let mut new = old.clone();
        let phase = new.metadata().phase();

        if !f(phase, new.metadata_mut().finalizers_mut())? {
            return Ok(());
        }
        new.metadata_mut().touch();

        items.insert(ptr.id.clone(), new.clone());
        trace!(resource = %ptr, finalizers = ?new.metadata().finalizers(), "finalizers changed");
        self.emit(Event::updated(old, new));

        Ok(())
    }

    /// Reads a resource.
    pub fn get(&self, ptr: &Pointer) -> Result<Resource> {
        let bucket = self.bucket(&ptr.kind());
        let items = bucket.read();
        items.get(&ptr.id).cloned().ok_or_else(|| StateError::NotFound(ptr.clone()))
    }

    /// Reads a typed resource in the type's default namespace.
    pub fn get_typed<T: ResourceType>(&self, id: &str) -> Result<Typed<T>> {
        self.get(&Pointer::new(T::NAMESPACE, T::TYPE, id))?.typed()
    }

    /// Lists resources of a kind, ordered by id.
    pub fn list(&self, kind: &Kind) -> Vec<Resource> {
        let bucket = self.bucket(kind);
        let items = bucket.read();
        items.values().cloned().collect()
    }

    /// Lists resources of a kind matching a label query.
    pub fn list_query(&self, kind: &Kind, query: &LabelQuery) -> Vec<Resource> {
        let bucket = self.bucket(kind);
        let items = bucket.read();
        items
            .values()
            .filter(|r| query.matches(r.metadata().labels()))
            .cloned()
            .collect()
    }

    /// Subscribes to future mutations within the scope.
    pub fn watch(&self, scope: WatchScope) -> Watcher {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().push(Subscription { scope, tx });
        Watcher { rx }
    }

    /// Subscribes to the scope, first delivering a `Created` event for every
    /// resource currently in it.
    ///
    /// Scopes not limited to a kind get no initial events.
    pub fn watch_bootstrap(&self, scope: WatchScope) -> Watcher {
        let Some(kind) = scope.kind() else {
            return self.watch(scope);
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let bucket = self.bucket(&kind);
        let items = bucket.read();

        for resource in items.values() {
            if scope.matches(resource.metadata()) {
                let _ = tx.send(Event::created(resource.clone()));
            }
        }

        self.subscriptions.lock().push(Subscription { scope, tx });
        drop(items);

        Watcher { rx }
    }

    /// Waits until a resource in the scope satisfies the predicate and returns it.
    pub async fn watch_for<P>(&self, scope: WatchScope, predicate: P) -> Result<Resource>
    where
        P: Fn(&Resource) -> bool,
    {
        let mut watcher = self.watch_bootstrap(scope);

        while let Some(event) = watcher.recv().await {
            if let Some(resource) = event.new {
                if predicate(&resource) {
                    return Ok(resource);
                }
            }
        }

        Err(StateError::WatchClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::EventType;
    use serde::Serialize;
    use std::time::Duration;

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    struct Param {
        value: String,
    }

    impl ResourceType for Param {
        const TYPE: &'static str = "Params.test.keel.dev";
        const NAMESPACE: &'static str = "test";
    }

    fn param(id: &str, value: &str, owner: Option<&str>) -> Resource {
        let mut r = Resource::new(id, Param { value: value.into() });
        r.metadata_mut().set_owner(owner.map(str::to_string));
        r
    }

    fn ptr(id: &str) -> Pointer {
        Pointer::new(Param::NAMESPACE, Param::TYPE, id)
    }

    #[test]
    fn test_create_and_get() {
        let store = Store::new();
        let created = store.create(param("a", "1", Some("ctrl"))).unwrap();
        assert_eq!(created.metadata().version(), Version::new(1));
        assert_eq!(created.metadata().phase(), Phase::Running);

        let got = store.get(&ptr("a")).unwrap();
        assert_eq!(got.spec::<Param>().unwrap().value, "1");
        assert_eq!(got.metadata().owner(), Some("ctrl"));
    }

    #[test]
    fn test_create_duplicate() {
        let store = Store::new();
        store.create(param("a", "1", None)).unwrap();
        let err = store.create(param("a", "2", None)).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn test_update_version_conflict() {
        let store = Store::new();
        let created = store.create(param("a", "1", Some("ctrl"))).unwrap();

        let mut next = created.clone();
        next.set_spec(Param { value: "2".into() });
        let updated = store.update(next).unwrap();
        assert_eq!(updated.metadata().version(), Version::new(2));

        let mut stale = created;
        stale.set_spec(Param { value: "3".into() });
        let err = store.update(stale).unwrap_err();
        assert!(matches!(err, StateError::VersionConflict { .. }));
    }

    #[test]
    fn test_update_owner_mismatch() {
        let store = Store::new();
        let created = store.create(param("a", "1", Some("ctrl"))).unwrap();

        let mut other = created.clone();
        other.metadata_mut().set_owner(Some("intruder".into()));
        let err = store.update(other).unwrap_err();
        assert!(matches!(err, StateError::OwnerMismatch { .. }));
    }

    #[test]
    fn test_update_not_found() {
        let store = Store::new();
        let err = store.update(param("missing", "1", None)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_destroy_requires_teardown() {
        let store = Store::new();
        store.create(param("a", "1", Some("ctrl"))).unwrap();

        let err = store.destroy(&ptr("a"), Some("ctrl")).unwrap_err();
        assert!(matches!(err, StateError::NotTearingDown(_)));

        let err = store.teardown(&ptr("a"), Some("other")).unwrap_err();
        assert!(matches!(err, StateError::OwnerMismatch { .. }));

        assert!(store.teardown(&ptr("a"), Some("ctrl")).unwrap().is_empty());
        store.destroy(&ptr("a"), Some("ctrl")).unwrap();
        assert!(store.get(&ptr("a")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_finalizers_block_destroy() {
        let store = Store::new();
        store.create(param("a", "1", Some("ctrl"))).unwrap();
        store.add_finalizer(&ptr("a"), "consumer").unwrap();

        let finalizers = store.teardown(&ptr("a"), Some("ctrl")).unwrap();
        assert!(finalizers.contains("consumer"));

        let err = store.destroy(&ptr("a"), Some("ctrl")).unwrap_err();
        assert!(matches!(err, StateError::HasFinalizers { .. }));

        // still visible while finalizers are pending
        let r = store.get(&ptr("a")).unwrap();
        assert_eq!(r.metadata().phase(), Phase::TearingDown);

        store.remove_finalizer(&ptr("a"), "consumer").unwrap();
        store.destroy(&ptr("a"), Some("ctrl")).unwrap();
    }

    #[test]
    fn test_finalizer_noop_does_not_bump() {
        let store = Store::new();
        store.create(param("a", "1", None)).unwrap();
        store.add_finalizer(&ptr("a"), "f").unwrap();
        let v = store.get(&ptr("a")).unwrap().metadata().version();

        store.add_finalizer(&ptr("a"), "f").unwrap();
        store.remove_finalizer(&ptr("a"), "absent").unwrap();
        assert_eq!(store.get(&ptr("a")).unwrap().metadata().version(), v);
    }

    #[test]
    fn test_add_finalizer_while_tearing_down() {
        let store = Store::new();
        store.create(param("a", "1", None)).unwrap();
        store.teardown(&ptr("a"), None).unwrap();

        let err = store.add_finalizer(&ptr("a"), "late").unwrap_err();
        assert!(matches!(err, StateError::PhaseConflict { .. }));
    }

    #[test]
    fn test_teardown_idempotent() {
        let store = Store::new();
        store.create(param("a", "1", None)).unwrap();
        store.teardown(&ptr("a"), None).unwrap();
        let v = store.get(&ptr("a")).unwrap().metadata().version();
        store.teardown(&ptr("a"), None).unwrap();
        assert_eq!(store.get(&ptr("a")).unwrap().metadata().version(), v);
    }

    #[test]
    fn test_update_preserves_phase_and_finalizers() {
        let store = Store::new();
        store.create(param("a", "1", None)).unwrap();
        store.add_finalizer(&ptr("a"), "f").unwrap();

        let mut current = store.get(&ptr("a")).unwrap();
        current.set_spec(Param { value: "2".into() });
        let updated = store.update(current).unwrap();
        assert!(updated.metadata().finalizers().contains("f"));
    }

    #[tokio::test]
    async fn test_watch_order() {
        let store = Store::new();
        let mut watcher = store.watch(WatchScope::Kind(Kind::new(Param::NAMESPACE, Param::TYPE)));

        let created = store.create(param("a", "1", None)).unwrap();
        let mut next = created;
        next.set_spec(Param { value: "2".into() });
        store.update(next).unwrap();
        store.teardown(&ptr("a"), None).unwrap();
        store.destroy(&ptr("a"), None).unwrap();

        let kinds: Vec<_> = (0..4)
            .map(|_| watcher.try_recv().unwrap().event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![EventType::Created, EventType::Updated, EventType::Updated, EventType::Destroyed]
        );
        assert!(watcher.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_watch_bootstrap() {
        let store = Store::new();
        store.create(param("a", "1", None)).unwrap();
        store.create(param("b", "1", None)).unwrap();

        let mut watcher = store.watch_bootstrap(WatchScope::Resource(ptr("b")));
        let event = watcher.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::Created);
        assert_eq!(event.metadata().unwrap().id(), "b");
        assert!(watcher.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_watch_for() {
        let store = Arc::new(Store::new());
        store.create(param("a", "1", None)).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .watch_for(WatchScope::Resource(ptr("a")), |r| {
                        r.spec::<Param>().is_some_and(|p| p.value == "ready")
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut current = store.get(&ptr("a")).unwrap();
        current.set_spec(Param { value: "ready".into() });
        store.update(current).unwrap();

        let found = waiter.await.unwrap().unwrap();
        assert_eq!(found.spec::<Param>().unwrap().value, "ready");
    }

    #[test]
    fn test_list_query() {
        let store = Store::new();
        let mut a = param("a", "1", None);
        a.metadata_mut().set_label("role", "x");
        store.create(a).unwrap();
        store.create(param("b", "1", None)).unwrap();

        let kind = Kind::new(Param::NAMESPACE, Param::TYPE);
        assert_eq!(store.list(&kind).len(), 2);
        let matched = store.list_query(&kind, &LabelQuery::equal("role", "x"));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].metadata().id(), "a");
    }

    #[test]
    fn test_type_registry() {
        let store = Store::new();
        assert!(!store.is_registered(Param::TYPE));
        store.register::<Param>();
        assert!(store.is_registered(Param::TYPE));
    }
}
