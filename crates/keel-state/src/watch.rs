//! Store events and watch subscriptions.

use tokio::sync::mpsc;

use crate::metadata::{Kind, LabelQuery, Metadata, Pointer};
use crate::resource::Resource;

/// Kind of store mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The resource was created.
    Created,
    /// The resource was updated (spec, phase or finalizers).
    Updated,
    /// The resource was removed from the store.
    Destroyed,
}

/// A store event carrying the resource before and after the mutation.
#[derive(Clone, Debug)]
pub struct Event {
    /// Mutation kind.
    pub event_type: EventType,
    /// Resource before the mutation; absent for `Created`.
    pub old: Option<Resource>,
    /// Resource after the mutation; absent for `Destroyed`.
    pub new: Option<Resource>,
}

impl Event {
    pub(crate) fn created(new: Resource) -> Self {
        Event {
            event_type: EventType::Created,
            old: None,
            new: Some(new),
        }
    }

    pub(crate) fn updated(old: Resource, new: Resource) -> Self {
        Event {
            event_type: EventType::Updated,
            old: Some(old),
            new: Some(new),
        }
    }

    pub(crate) fn destroyed(old: Resource) -> Self {
        Event {
            event_type: EventType::Destroyed,
            old: Some(old),
            new: None,
        }
    }

    /// The most recent state of the resource: `new` if present, `old` otherwise.
    pub fn resource(&self) -> Option<&Resource> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Metadata of the most recent state.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.resource().map(|r| r.metadata())
    }
}

/// What a watcher subscribes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchScope {
    /// A single resource.
    Resource(Pointer),
    /// Every resource of a kind.
    Kind(Kind),
    /// Resources of a kind matching a label query.
    Labels(Kind, LabelQuery),
    /// Every resource in the store.
    All,
}

impl WatchScope {
    /// Checks whether a resource falls into the scope.
    pub fn matches(&self, md: &Metadata) -> bool {
        match self {
            WatchScope::Resource(ptr) => md.pointer() == ptr,
            WatchScope::Kind(kind) => md.namespace() == kind.namespace && md.res_type() == kind.res_type,
            WatchScope::Labels(kind, query) => {
                md.namespace() == kind.namespace && md.res_type() == kind.res_type && query.matches(md.labels())
            }
            WatchScope::All => true,
        }
    }

    /// Checks whether an event concerns the scope; label scopes match on either side of the change.
    pub fn matches_event(&self, event: &Event) -> bool {
        event.old.as_ref().is_some_and(|r| self.matches(r.metadata()))
            || event.new.as_ref().is_some_and(|r| self.matches(r.metadata()))
    }

    /// Kind the scope is limited to, if any.
    pub fn kind(&self) -> Option<Kind> {
        match self {
            WatchScope::Resource(ptr) => Some(ptr.kind()),
            WatchScope::Kind(kind) | WatchScope::Labels(kind, _) => Some(kind.clone()),
            WatchScope::All => None,
        }
    }
}

/// Receiving side of a watch subscription.
///
/// Events are delivered in the order the store applied the mutations. Dropping
/// the watcher unsubscribes it.
#[derive(Debug)]
pub struct Watcher {
    pub(crate) rx: mpsc::UnboundedReceiver<Event>,
}

impl Watcher {
    /// Waits for the next event; returns `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
