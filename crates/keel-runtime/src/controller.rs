//! Controller trait and input/output descriptors.

use async_trait::async_trait;
use keel_state::{Event, Phase, ResourceType};
use tokio_util::sync::CancellationToken;

use crate::adapter::ControllerRuntime;
use crate::error::ControllerResult;

/// How a controller depends on an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputKind {
    /// Observe only.
    Weak,
    /// Lifecycle-coupled: the controller holds finalizers on the input while it uses it.
    Strong,
    /// Wake only when the input is tearing down.
    DestroyReady,
}

/// An input declaration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Input {
    /// Namespace of the input.
    pub namespace: String,
    /// Type of the input.
    pub res_type: String,
    /// Optional id restricting the input to a single resource.
    pub id: Option<String>,
    /// Dependency kind.
    pub kind: InputKind,
}

impl Input {
    /// A weak input on `T` in its default namespace.
    pub fn weak<T: ResourceType>() -> Self {
        Self::of::<T>(InputKind::Weak)
    }

    /// A strong input on `T` in its default namespace.
    pub fn strong<T: ResourceType>() -> Self {
        Self::of::<T>(InputKind::Strong)
    }

    /// A destroy-ready input on `T` in its default namespace.
    pub fn destroy_ready<T: ResourceType>() -> Self {
        Self::of::<T>(InputKind::DestroyReady)
    }

    fn of<T: ResourceType>(kind: InputKind) -> Self {
        Input {
            namespace: T::NAMESPACE.to_string(),
            res_type: T::TYPE.to_string(),
            id: None,
            kind,
        }
    }

    /// Restricts the input to a single id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Overrides the namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Checks whether a store event should wake a controller holding this input.
    pub fn wants(&self, event: &Event) -> bool {
        let Some(md) = event.metadata() else {
            return false;
        };

        if md.namespace() != self.namespace || md.res_type() != self.res_type {
            return false;
        }

        if let Some(id) = &self.id {
            if md.id() != id {
                return false;
            }
        }

        match self.kind {
            InputKind::Weak | InputKind::Strong => true,
            InputKind::DestroyReady => event
                .new
                .as_ref()
                .is_some_and(|r| r.metadata().phase() == Phase::TearingDown),
        }
    }
}

/// Whether an output type is produced by one or many controllers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Only this controller produces the type.
    Exclusive,
    /// Several controllers may produce the type, each owning its own ids.
    Shared,
}

/// An output declaration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Output {
    /// Output type.
    pub res_type: String,
    /// Ownership kind.
    pub kind: OutputKind,
}

impl Output {
    /// An exclusive output of `T`.
    pub fn exclusive<T: ResourceType>() -> Self {
        Output {
            res_type: T::TYPE.to_string(),
            kind: OutputKind::Exclusive,
        }
    }

    /// A shared output of `T`.
    pub fn shared<T: ResourceType>() -> Self {
        Output {
            res_type: T::TYPE.to_string(),
            kind: OutputKind::Shared,
        }
    }
}

/// A controller reconciles its outputs from its inputs.
///
/// `run` is invoked by the runtime and is expected to loop until the
/// cancellation token fires, returning `Ok(())` in that case. Returning an
/// error makes the runtime restart the controller after a backoff delay; the
/// controller value is kept, so state held in fields survives restarts.
#[async_trait]
pub trait Controller: Send + 'static {
    /// Globally unique name, used as owner and finalizer tag.
    fn name(&self) -> &str;

    /// Declared inputs.
    fn inputs(&self) -> Vec<Input>;

    /// Declared outputs.
    fn outputs(&self) -> Vec<Output>;

    /// Reconcile loop.
    async fn run(&mut self, ctx: &CancellationToken, r: &mut ControllerRuntime) -> ControllerResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_state::{Resource, Store, WatchScope};
    use serde::Serialize;

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    struct Spec;

    impl ResourceType for Spec {
        const TYPE: &'static str = "Specs.test.keel.dev";
        const NAMESPACE: &'static str = "test";
    }

    #[test]
    fn test_input_wants() {
        let store = Store::new();
        let mut watcher = store.watch(WatchScope::All);

        store.create(Resource::new("a", Spec)).unwrap();
        store.create(Resource::new("b", Spec)).unwrap();
        let ptr = keel_state::Pointer::new("test", Spec::TYPE, "a");
        store.teardown(&ptr, None).unwrap();

        let created_a = watcher.try_recv().unwrap();
        let created_b = watcher.try_recv().unwrap();
        let torn_a = watcher.try_recv().unwrap();

        let weak = Input::weak::<Spec>();
        assert!(weak.wants(&created_a));
        assert!(weak.wants(&created_b));

        let single = Input::weak::<Spec>().with_id("b");
        assert!(!single.wants(&created_a));
        assert!(single.wants(&created_b));

        let ready = Input::destroy_ready::<Spec>();
        assert!(!ready.wants(&created_a));
        assert!(ready.wants(&torn_a));

        let other_ns = Input::weak::<Spec>().in_namespace("other");
        assert!(!other_ns.wants(&created_a));
    }
}
