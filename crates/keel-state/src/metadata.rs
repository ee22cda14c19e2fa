//! Resource metadata: identity, version, phase, ownership, finalizers and labels.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Monotonically increasing resource version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(v: u64) -> Self {
        Version(v)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource lifecycle phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// The resource is live.
    #[default]
    Running,
    /// The resource is being torn down; it is removed once finalizers are released.
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => write!(f, "running"),
            Phase::TearingDown => write!(f, "tearingDown"),
        }
    }
}

/// A resource kind: type within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Kind {
    /// Namespace.
    pub namespace: String,
    /// Fully-qualified type name.
    pub res_type: String,
}

impl Kind {
    /// Creates a new kind.
    pub fn new(namespace: impl Into<String>, res_type: impl Into<String>) -> Self {
        Kind {
            namespace: namespace.into(),
            res_type: res_type.into(),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.res_type)
    }
}

/// Points at a single resource by namespace, type and id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pointer {
    /// Namespace.
    pub namespace: String,
    /// Fully-qualified type name.
    pub res_type: String,
    /// Resource id, unique within the kind.
    pub id: String,
}

impl Pointer {
    /// Creates a new pointer.
    pub fn new(namespace: impl Into<String>, res_type: impl Into<String>, id: impl Into<String>) -> Self {
        Pointer {
            namespace: namespace.into(),
            res_type: res_type.into(),
            id: id.into(),
        }
    }

    /// Returns the kind of the pointed resource.
    pub fn kind(&self) -> Kind {
        Kind::new(self.namespace.clone(), self.res_type.clone())
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.res_type, self.id)
    }
}

/// A single label selector term.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelTerm {
    /// Label is present with the given value.
    Equal(String, String),
    /// Label is present.
    Exists(String),
    /// Label is absent.
    NotExists(String),
}

/// Conjunction of label terms.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelQuery {
    /// Terms, all of which must match.
    pub terms: Vec<LabelTerm>,
}

impl LabelQuery {
    /// Creates a query matching a single label value.
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        LabelQuery {
            terms: vec![LabelTerm::Equal(key.into(), value.into())],
        }
    }

    /// Adds a term to the query.
    pub fn and(mut self, term: LabelTerm) -> Self {
        self.terms.push(term);
        self
    }

    /// Checks the query against a label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|term| match term {
            LabelTerm::Equal(k, v) => labels.get(k) == Some(v),
            LabelTerm::Exists(k) => labels.contains_key(k),
            LabelTerm::NotExists(k) => !labels.contains_key(k),
        })
    }
}

/// Resource metadata.
///
/// Version and phase are managed by the store; the remaining fields are set by the writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pointer: Pointer,
    version: Version,
    phase: Phase,
    owner: Option<String>,
    finalizers: BTreeSet<String>,
    labels: BTreeMap<String, String>,
    created: SystemTime,
    updated: SystemTime,
}

impl Metadata {
    /// Creates metadata for a new resource.
    pub fn new(namespace: impl Into<String>, res_type: impl Into<String>, id: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Metadata {
            pointer: Pointer::new(namespace, res_type, id),
            version: Version::default(),
            phase: Phase::Running,
            owner: None,
            finalizers: BTreeSet::new(),
            labels: BTreeMap::new(),
            created: now,
            updated: now,
        }
    }

    /// Namespace of the resource.
    pub fn namespace(&self) -> &str {
        &self.pointer.namespace
    }

    /// Type of the resource.
    pub fn res_type(&self) -> &str {
        &self.pointer.res_type
    }

    /// Id of the resource.
    pub fn id(&self) -> &str {
        &self.pointer.id
    }

    /// Pointer to the resource.
    pub fn pointer(&self) -> &Pointer {
        &self.pointer
    }

    /// Kind of the resource.
    pub fn kind(&self) -> Kind {
        self.pointer.kind()
    }

    /// Current version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Owning controller, if any.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Attached finalizers.
    pub fn finalizers(&self) -> &BTreeSet<String> {
        &self.finalizers
    }

    /// Labels.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Creation time.
    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Last update time.
    pub fn updated(&self) -> SystemTime {
        self.updated
    }

    /// Sets the owner recorded on create.
    pub fn set_owner(&mut self, owner: Option<String>) {
        self.owner = owner;
    }

    /// Sets a label.
    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    /// Removes a label.
    pub fn remove_label(&mut self, key: &str) {
        self.labels.remove(key);
    }

    /// Replaces the version, used by writers building an update from a read snapshot.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn finalizers_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.finalizers
    }

    pub(crate) fn touch(&mut self) {
        self.version = self.version.next();
        self.updated = SystemTime::now();
    }

    pub(crate) fn reset_created(&mut self) {
        let now = SystemTime::now();
        self.created = now;
        self.updated = now;
    }

    pub(crate) fn inherit(&mut self, stored: &Metadata) {
        self.version = stored.version;
        self.phase = stored.phase;
        self.finalizers = stored.finalizers.clone();
        self.created = stored.created;
    }
}
