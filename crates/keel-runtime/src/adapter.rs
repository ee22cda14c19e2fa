//! The scoped runtime handle passed to a running controller.
//!
//! All writes go through the handle, which enforces declared outputs and
//! ownership and records touched outputs for declarative cleanup.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use keel_state::{
    Kind, LabelQuery, Metadata, Phase, Pointer, Resource, ResourceType, StateError, Store, Typed, WatchScope,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::controller::{Input, Output};
use crate::error::{ControllerError, ControllerResult};

/// Scoped runtime handle for one controller.
pub struct ControllerRuntime {
    name: String,
    store: Arc<Store>,
    inputs: Arc<RwLock<Vec<Input>>>,
    outputs: Vec<Output>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: mpsc::Receiver<()>,
    tracking: bool,
    touched: HashMap<String, HashSet<Pointer>>,
    reset_backoff: bool,
}

impl ControllerRuntime {
    pub(crate) fn new(
        name: String,
        store: Arc<Store>,
        inputs: Arc<RwLock<Vec<Input>>>,
        outputs: Vec<Output>,
        wake_tx: mpsc::Sender<()>,
        wake_rx: mpsc::Receiver<()>,
    ) -> Self {
        ControllerRuntime {
            name,
            store,
            inputs,
            outputs,
            wake_tx,
            wake_rx,
            tracking: false,
            touched: HashMap::new(),
            reset_backoff: false,
        }
    }

    /// Creates a standalone handle with its own wakeup channel, not driven by a [`crate::Runtime`].
    pub fn standalone(name: impl Into<String>, store: Arc<Store>, inputs: Vec<Input>, outputs: Vec<Output>) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self::new(name.into(), store, Arc::new(RwLock::new(inputs)), outputs, wake_tx, wake_rx)
    }

    /// Controller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next coalesced wakeup.
    ///
    /// Returns `None` when the runtime stops feeding events.
    pub async fn event(&mut self) -> Option<()> {
        self.wake_rx.recv().await
    }

    /// Queues a reconcile pass; coalesces with pending wakeups.
    pub fn queue_reconcile(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Replaces the input set.
    pub fn update_inputs(&mut self, inputs: Vec<Input>) {
        *self.inputs.write() = inputs;
    }

    /// Current input set.
    pub fn inputs(&self) -> Vec<Input> {
        self.inputs.read().clone()
    }

    /// Clears accumulated restart backoff once the controller errors next.
    pub fn reset_restart_backoff(&mut self) {
        self.reset_backoff = true;
    }

    pub(crate) fn take_backoff_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_backoff)
    }

    /// Reads a resource by pointer.
    pub fn get_resource(&self, ptr: &Pointer) -> ControllerResult<Option<Resource>> {
        match self.store.get(ptr) {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads a typed resource from its default namespace.
    pub fn get<T: ResourceType>(&self, id: &str) -> ControllerResult<Option<Typed<T>>> {
        self.get_in::<T>(T::NAMESPACE, id)
    }

    /// Reads a typed resource from a namespace.
    pub fn get_in<T: ResourceType>(&self, namespace: &str, id: &str) -> ControllerResult<Option<Typed<T>>> {
        match self.get_resource(&Pointer::new(namespace, T::TYPE, id))? {
            Some(r) => Ok(Some(r.typed::<T>()?)),
            None => Ok(None),
        }
    }

    /// Lists typed resources in the default namespace.
    pub fn list<T: ResourceType>(&self) -> ControllerResult<Vec<Typed<T>>> {
        self.list_in::<T>(T::NAMESPACE)
    }

    /// Lists typed resources in a namespace.
    pub fn list_in<T: ResourceType>(&self, namespace: &str) -> ControllerResult<Vec<Typed<T>>> {
        self.store
            .list(&Kind::new(namespace, T::TYPE))
            .iter()
            .map(|r| r.typed::<T>().map_err(ControllerError::from))
            .collect()
    }

    /// Lists typed resources in the default namespace matching a label query.
    pub fn list_query<T: ResourceType>(&self, query: &LabelQuery) -> ControllerResult<Vec<Typed<T>>> {
        self.store
            .list_query(&Kind::new(T::NAMESPACE, T::TYPE), query)
            .iter()
            .map(|r| r.typed::<T>().map_err(ControllerError::from))
            .collect()
    }

    fn check_output(&self, res_type: &str) -> ControllerResult<()> {
        if self.outputs.iter().any(|o| o.res_type == res_type) {
            Ok(())
        } else {
            Err(ControllerError::OutputNotDeclared {
                controller: self.name.clone(),
                res_type: res_type.to_string(),
            })
        }
    }

    fn check_owned(&self, md: &Metadata) -> ControllerResult<()> {
        if md.owner() != Some(self.name.as_str()) {
            return Err(StateError::OwnerMismatch {
                pointer: md.pointer().clone(),
                owner: md.owner().map(str::to_string),
                caller: Some(self.name.clone()),
            }
            .into());
        }
        Ok(())
    }

    fn touch(&mut self, ptr: &Pointer) {
        if self.tracking {
            self.touched.entry(ptr.res_type.clone()).or_default().insert(ptr.clone());
        }
    }

    /// Read-modify-write of an output in its default namespace, creating it from
    /// `T::default()` if absent.
    pub fn modify<T, F>(&mut self, id: &str, f: F) -> ControllerResult<()>
    where
        T: ResourceType + Default,
        F: FnOnce(&mut T) -> ControllerResult<()>,
    {
        self.modify_full::<T, _>(T::NAMESPACE, id, |_, spec| f(spec))
    }

    /// Read-modify-write of an output in a namespace.
    pub fn modify_in<T, F>(&mut self, namespace: &str, id: &str, f: F) -> ControllerResult<()>
    where
        T: ResourceType + Default,
        F: FnOnce(&mut T) -> ControllerResult<()>,
    {
        self.modify_full::<T, _>(namespace, id, |_, spec| f(spec))
    }

    /// Read-modify-write of an output with access to its metadata (labels).
    ///
    /// The write is skipped when neither spec nor labels changed.
    pub fn modify_full<T, F>(&mut self, namespace: &str, id: &str, f: F) -> ControllerResult<()>
    where
        T: ResourceType + Default,
        F: FnOnce(&mut Metadata, &mut T) -> ControllerResult<()>,
    {
        self.check_output(T::TYPE)?;

        let ptr = Pointer::new(namespace, T::TYPE, id);
        self.touch(&ptr);

        match self.get_resource(&ptr)? {
            None => {
                let mut md = Metadata::new(namespace, T::TYPE, id);
                let mut spec = T::default();
                f(&mut md, &mut spec)?;
                md.set_owner(Some(self.name.clone()));
                self.store.create(Resource::from_parts(md, spec))?;
            }
            Some(current) => {
                self.check_owned(current.metadata())?;

                if current.metadata().phase() == Phase::TearingDown {
                    return Err(StateError::PhaseConflict {
                        pointer: ptr,
                        phase: Phase::TearingDown,
                    }
                    .into());
                }

                let typed = current.typed::<T>()?;
                let mut md = typed.metadata.clone();
                let mut spec = typed.spec.clone();
                f(&mut md, &mut spec)?;
                md.set_owner(Some(self.name.clone()));

                if spec == typed.spec && md.labels() == typed.metadata.labels() {
                    return Ok(());
                }

                self.store.update(Resource::from_parts(md, spec))?;
            }
        }

        Ok(())
    }

    /// Creates an output; the controller is recorded as owner.
    pub fn create(&mut self, mut resource: Resource) -> ControllerResult<()> {
        self.check_output(resource.metadata().res_type())?;
        resource.metadata_mut().set_owner(Some(self.name.clone()));
        let ptr = resource.metadata().pointer().clone();
        self.touch(&ptr);
        self.store.create(resource)?;
        Ok(())
    }

    /// Updates an output read earlier.
    pub fn update(&mut self, resource: Resource) -> ControllerResult<()> {
        self.check_output(resource.metadata().res_type())?;
        self.check_owned(resource.metadata())?;
        let ptr = resource.metadata().pointer().clone();
        self.touch(&ptr);
        self.store.update(resource)?;
        Ok(())
    }

    /// Moves an owned output to `TearingDown`; returns true if it has no finalizers.
    pub fn teardown(&mut self, ptr: &Pointer) -> ControllerResult<bool> {
        self.check_output(&ptr.res_type)?;
        let finalizers = self.store.teardown(ptr, Some(&self.name))?;
        Ok(finalizers.is_empty())
    }

    /// Destroys an owned output which is torn down.
    pub fn destroy(&mut self, ptr: &Pointer) -> ControllerResult<()> {
        self.check_output(&ptr.res_type)?;
        self.store.destroy(ptr, Some(&self.name))?;
        Ok(())
    }

    /// Tears down an owned output and destroys it if no finalizers remain.
    ///
    /// Returns true if the resource is gone. A missing resource counts as gone.
    pub fn teardown_and_destroy(&mut self, ptr: &Pointer) -> ControllerResult<bool> {
        match self.teardown(ptr) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(ControllerError::State(e)) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e),
        }

        match self.destroy(ptr) {
            Ok(()) => Ok(true),
            Err(ControllerError::State(e)) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Adds a finalizer to any resource.
    pub fn add_finalizer(&self, ptr: &Pointer, finalizer: &str) -> ControllerResult<()> {
        self.store.add_finalizer(ptr, finalizer)?;
        Ok(())
    }

    /// Removes a finalizer from any resource; a missing resource is not an error.
    pub fn remove_finalizer(&self, ptr: &Pointer, finalizer: &str) -> ControllerResult<()> {
        match self.store.remove_finalizer(ptr, finalizer) {
            Err(e) if e.is_not_found() => Ok(()),
            other => Ok(other?),
        }
    }

    /// Starts a tracking pass: touches are recorded until the matching cleanup.
    pub fn start_tracking_outputs(&mut self) {
        self.tracking = true;
        self.touched.clear();
    }

    /// Destroys every output of `T` owned by this controller and not touched
    /// since [`Self::start_tracking_outputs`].
    ///
    /// Outputs with finalizers are left tearing down; the controller is woken
    /// again once they lose their last finalizer.
    pub fn cleanup_outputs<T: ResourceType>(&mut self) -> ControllerResult<()> {
        self.check_output(T::TYPE)?;

        let touched = self.touched.get(T::TYPE).cloned().unwrap_or_default();
        let mut namespaces: BTreeSet<String> = touched.iter().map(|p| p.namespace.clone()).collect();
        namespaces.insert(T::NAMESPACE.to_string());

        for namespace in namespaces {
            for resource in self.store.list(&Kind::new(namespace, T::TYPE)) {
                let md = resource.metadata();
                if md.owner() != Some(self.name.as_str()) || touched.contains(md.pointer()) {
                    continue;
                }

                let ptr = md.pointer().clone();
                if !self.teardown_and_destroy(&ptr)? {
                    debug!(resource = %ptr, "output cleanup waiting for finalizers");
                }
            }
        }

        Ok(())
    }

    /// Blocks until resource `id` of `T` satisfies the predicate.
    ///
    /// While waiting only that resource is observed; afterwards the full input
    /// set is restored and a reconcile is queued. Returns `false` if cancelled.
    pub async fn wait_for_condition<T, P>(&mut self, ctx: &CancellationToken, id: &str, predicate: P) -> ControllerResult<bool>
    where
        T: ResourceType,
        P: Fn(&T) -> bool,
    {
        let saved = std::mem::replace(&mut *self.inputs.write(), vec![Input::weak::<T>().with_id(id)]);
        let ptr = Pointer::new(T::NAMESPACE, T::TYPE, id);
        let store = Arc::clone(&self.store);

        let result = tokio::select! {
            _ = ctx.cancelled() => Ok(false),
            res = store.watch_for(WatchScope::Resource(ptr), |r| r.spec::<T>().is_some_and(&predicate)) => {
                res.map(|_| true).map_err(ControllerError::from)
            }
        };

        *self.inputs.write() = saved;
        self.queue_reconcile();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    struct Out {
        value: u32,
    }

    impl ResourceType for Out {
        const TYPE: &'static str = "Outs.test.keel.dev";
        const NAMESPACE: &'static str = "test";
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    struct Gate {
        open: bool,
    }

    impl ResourceType for Gate {
        const TYPE: &'static str = "Gates.test.keel.dev";
        const NAMESPACE: &'static str = "test";
    }

    fn runtime(store: &Arc<Store>, name: &str) -> ControllerRuntime {
        ControllerRuntime::standalone(name, Arc::clone(store), vec![], vec![Output::shared::<Out>()])
    }

    #[test]
    fn test_modify_creates_and_updates() {
        let store = Arc::new(Store::new());
        let mut r = runtime(&store, "ctrl");

        r.modify::<Out, _>("a", |o| {
            o.value = 1;
            Ok(())
        })
        .unwrap();
        let got = r.get::<Out>("a").unwrap().unwrap();
        assert_eq!(got.spec.value, 1);
        assert_eq!(got.metadata.owner(), Some("ctrl"));
        let v1 = got.metadata.version();

        // no-op modification doesn't bump the version
        r.modify::<Out, _>("a", |o| {
            o.value = 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(r.get::<Out>("a").unwrap().unwrap().metadata.version(), v1);

        r.modify::<Out, _>("a", |o| {
            o.value = 2;
            Ok(())
        })
        .unwrap();
        assert_eq!(r.get::<Out>("a").unwrap().unwrap().spec.value, 2);
    }

    #[test]
    fn test_modify_other_owner() {
        let store = Arc::new(Store::new());
        let mut a = runtime(&store, "a");
        let mut b = runtime(&store, "b");

        a.modify::<Out, _>("x", |_| Ok(())).unwrap();
        let err = b.modify::<Out, _>("x", |o| {
            o.value = 5;
            Ok(())
        });
        assert!(matches!(err, Err(ControllerError::State(StateError::OwnerMismatch { .. }))));
    }

    #[test]
    fn test_undeclared_output() {
        let store = Arc::new(Store::new());
        let mut r = runtime(&store, "ctrl");
        let err = r.modify::<Gate, _>("g", |_| Ok(())).unwrap_err();
        assert!(matches!(err, ControllerError::OutputNotDeclared { .. }));
    }

    #[test]
    fn test_tracking_cleanup() {
        let store = Arc::new(Store::new());
        let mut r = runtime(&store, "ctrl");

        r.start_tracking_outputs();
        for id in ["a", "b", "c"] {
            r.modify::<Out, _>(id, |_| Ok(())).unwrap();
        }
        r.cleanup_outputs::<Out>().unwrap();
        assert_eq!(r.list::<Out>().unwrap().len(), 3);

        r.start_tracking_outputs();
        r.modify::<Out, _>("b", |_| Ok(())).unwrap();
        r.cleanup_outputs::<Out>().unwrap();

        let ids: Vec<_> = r.list::<Out>().unwrap().iter().map(|o| o.id().to_string()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn test_cleanup_leaves_other_owners() {
        let store = Arc::new(Store::new());
        let mut a = runtime(&store, "a");
        let mut b = runtime(&store, "b");

        b.modify::<Out, _>("foreign", |_| Ok(())).unwrap();

        a.start_tracking_outputs();
        a.cleanup_outputs::<Out>().unwrap();

        assert!(a.get::<Out>("foreign").unwrap().is_some());
    }

    #[test]
    fn test_cleanup_waits_for_finalizers() {
        let store = Arc::new(Store::new());
        let mut r = runtime(&store, "ctrl");

        r.modify::<Out, _>("a", |_| Ok(())).unwrap();
        let ptr = Pointer::new("test", Out::TYPE, "a");
        r.add_finalizer(&ptr, "consumer").unwrap();

        r.start_tracking_outputs();
        r.cleanup_outputs::<Out>().unwrap();
        let still = r.get::<Out>("a").unwrap().unwrap();
        assert_eq!(still.metadata.phase(), Phase::TearingDown);

        r.remove_finalizer(&ptr, "consumer").unwrap();
        r.cleanup_outputs::<Out>().unwrap();
        assert!(r.get::<Out>("a").unwrap().is_none());
    }

    #[test]
    fn test_modify_tearing_down() {
        let store = Arc::new(Store::new());
        let mut r = runtime(&store, "ctrl");
        r.modify::<Out, _>("a", |_| Ok(())).unwrap();
        let ptr = Pointer::new("test", Out::TYPE, "a");
        r.add_finalizer(&ptr, "consumer").unwrap();
        assert!(!r.teardown(&ptr).unwrap());

        let err = r.modify::<Out, _>("a", |_| Ok(())).unwrap_err();
        assert!(matches!(err, ControllerError::State(StateError::PhaseConflict { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_condition() {
        let store = Arc::new(Store::new());
        let mut r = ControllerRuntime::standalone("ctrl", Arc::clone(&store), vec![Input::weak::<Out>()], vec![]);
        let ctx = CancellationToken::new();

        store.create(Resource::new("gate", Gate { open: false })).unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                let mut current = store.get(&Pointer::new("test", Gate::TYPE, "gate")).unwrap();
                current.set_spec(Gate { open: true });
                store.update(current).unwrap();
            })
        };

        let met = r.wait_for_condition::<Gate, _>(&ctx, "gate", |g| g.open).await.unwrap();
        assert!(met);
        writer.await.unwrap();

        // inputs restored and reconcile queued
        assert_eq!(r.inputs(), vec![Input::weak::<Out>()]);
        assert_eq!(r.event().await, Some(()));
    }

    #[tokio::test]
    async fn test_wait_for_condition_cancelled() {
        let store = Arc::new(Store::new());
        let mut r = ControllerRuntime::standalone("ctrl", Arc::clone(&store), vec![], vec![]);
        let ctx = CancellationToken::new();
        ctx.cancel();

        let met = r.wait_for_condition::<Gate, _>(&ctx, "gate", |g| g.open).await.unwrap();
        assert!(!met);
    }
}
