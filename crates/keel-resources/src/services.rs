//! Collaborator kinds observed but produced elsewhere: services, time,
//! network, secrets, Kubernetes and etcd.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{ETCD_NAMESPACE, K8S_NAMESPACE, NETWORK_NAMESPACE, SECRETS_NAMESPACE, V1ALPHA1_NAMESPACE};

/// State of a system service, keyed by service id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Process is running.
    pub running: bool,
    /// Health check passes.
    pub healthy: bool,
    /// Service has no health check.
    pub unknown: bool,
}
resource!(Service, "Services.v1alpha1.keel.dev", V1ALPHA1_NAMESPACE);

impl Service {
    /// Running, and healthy or without a health check.
    pub fn is_up(&self) -> bool {
        self.running && (self.healthy || self.unknown)
    }
}

/// Time synchronization state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStatus {
    /// Clock is synchronized.
    pub synced: bool,
    /// Synchronization epoch, bumped on large jumps.
    pub epoch: u32,
}
resource!(TimeStatus, "TimeStatuses.v1alpha1.keel.dev", V1ALPHA1_NAMESPACE);

impl TimeStatus {
    /// Singleton id.
    pub const ID: &'static str = "node";
}

/// Network readiness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// An address is assigned.
    pub address_ready: bool,
    /// A default route exists.
    pub connectivity_ready: bool,
    /// Hostname is set.
    pub hostname_ready: bool,
    /// `/etc` network files are rendered.
    pub etc_files_ready: bool,
}
resource!(NetworkStatus, "NetworkStatuses.network.keel.dev", NETWORK_NAMESPACE);

impl NetworkStatus {
    /// Singleton id.
    pub const ID: &'static str = "status";
}

/// Current node addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddresses {
    /// Addresses.
    pub addresses: Vec<IpAddr>,
}
resource!(NodeAddresses, "NodeAddresses.network.keel.dev", NETWORK_NAMESPACE);

impl NodeAddresses {
    /// Id of the routed address set.
    pub const CURRENT_ID: &'static str = "current";
}

/// PEM-encoded certificate and key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateAndKey {
    /// Certificate.
    pub cert: String,
    /// Private key.
    pub key: String,
}

/// TLS material of the maintenance API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceServiceCerts {
    /// Issuing CA.
    pub ca: CertificateAndKey,
    /// Server certificate.
    pub server: CertificateAndKey,
}
resource!(MaintenanceServiceCerts, "MaintenanceServiceCertificates.secrets.keel.dev", SECRETS_NAMESPACE);

impl MaintenanceServiceCerts {
    /// Singleton id.
    pub const ID: &'static str = "maintenance";
}

/// Kubelet settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeletSpec {
    /// Kubelet image reference.
    pub image: String,
}
resource!(KubeletSpec, "KubeletSpecs.kubernetes.keel.dev", K8S_NAMESPACE);

impl KubeletSpec {
    /// Singleton id.
    pub const ID: &'static str = "kubelet";
}

/// Pod phase of a static pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Not scheduled.
    #[default]
    Pending,
    /// Running.
    Running,
    /// Terminated successfully.
    Succeeded,
    /// Terminated with failure.
    Failed,
    /// State unknown.
    Unknown,
}

/// Status of a static pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPodStatus {
    /// Phase.
    pub phase: PodPhase,
    /// The `Ready` condition is true.
    pub ready: bool,
}
resource!(StaticPodStatus, "StaticPodStatuses.kubernetes.keel.dev", K8S_NAMESPACE);

/// The Kubernetes node name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nodename {
    /// Node name.
    pub nodename: String,
    /// Node registration is disabled.
    pub skip_node_registration: bool,
}
resource!(Nodename, "Nodenames.kubernetes.keel.dev", K8S_NAMESPACE);

impl Nodename {
    /// Singleton id.
    pub const ID: &'static str = "nodename";
}

/// Kubernetes node status, keyed by node name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node reports `Ready`.
    pub node_ready: bool,
    /// Node is cordoned.
    pub unschedulable: bool,
}
resource!(NodeStatus, "NodeStatuses.kubernetes.keel.dev", K8S_NAMESPACE);

/// etcd settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdSpec {
    /// etcd image reference.
    pub image: String,
}
resource!(EtcdSpec, "EtcdSpecs.etcd.keel.dev", ETCD_NAMESPACE);

impl EtcdSpec {
    /// Singleton id.
    pub const ID: &'static str = "etcd";
}
