#![warn(missing_docs)]

//! Keel resource kinds and the machine configuration document model.
//!
//! Every kind implements [`keel_state::ResourceType`]; [`register_all`] adds
//! them to a store so controllers can declare them as inputs and outputs.

use keel_state::Store;

macro_rules! resource {
    ($ty:ident, $type_name:literal, $namespace:expr) => {
        impl keel_state::ResourceType for $ty {
            const TYPE: &'static str = $type_name;
            const NAMESPACE: &'static str = $namespace;
        }
    };
}

pub mod block;
pub mod config;
pub mod cri;
pub mod document;
pub mod duration;
pub mod error;
pub mod runtime;
pub mod services;

pub use error::{ResourceError, Result};

/// Namespace of configuration resources.
pub const CONFIG_NAMESPACE: &str = "config";
/// Namespace of runtime resources.
pub const RUNTIME_NAMESPACE: &str = "runtime";
/// Namespace of block device resources.
pub const BLOCK_NAMESPACE: &str = "block";
/// Namespace of container runtime resources.
pub const CRI_NAMESPACE: &str = "cri";
/// Namespace of service resources.
pub const V1ALPHA1_NAMESPACE: &str = "v1alpha1";
/// Namespace of network resources.
pub const NETWORK_NAMESPACE: &str = "network";
/// Namespace of secrets.
pub const SECRETS_NAMESPACE: &str = "secrets";
/// Namespace of Kubernetes resources.
pub const K8S_NAMESPACE: &str = "k8s";
/// Namespace of etcd resources.
pub const ETCD_NAMESPACE: &str = "etcd";

/// Registers every resource kind with the store.
pub fn register_all(store: &Store) {
    use block::*;
    use config::*;
    use cri::*;
    use runtime::*;
    use services::*;

    store.register::<MachineConfig>();
    store.register::<MachineType>();

    store.register::<KernelParamSpec>();
    store.register::<KernelParamDefaultSpec>();
    store.register::<KernelParamStatus>();
    store.register::<KernelModuleSpec>();
    store.register::<KernelModuleStatus>();
    store.register::<LoadedKernelModule>();
    store.register::<KernelCmdline>();
    store.register::<KmsgLogConfig>();
    store.register::<EventSinkConfig>();
    store.register::<WatchdogTimerConfig>();
    store.register::<WatchdogTimerStatus>();
    store.register::<FSScrubConfig>();
    store.register::<FSScrubStatus>();
    store.register::<MaintenanceServiceConfig>();
    store.register::<MaintenanceServiceRequest>();
    store.register::<SeccompProfile>();
    store.register::<ExtensionServicesConfig>();
    store.register::<MachineStatus>();
    store.register::<SecurityState>();
    store.register::<BootedEntry>();
    store.register::<ExtensionStatus>();
    store.register::<SBOMItem>();
    store.register::<OOMAction>();
    store.register::<Diagnostic>();

    store.register::<VolumeConfig>();
    store.register::<VolumeStatus>();
    store.register::<VolumeMountRequest>();
    store.register::<VolumeMountStatus>();

    store.register::<ImageCacheConfig>();
    store.register::<RegistriesConfig>();

    store.register::<Service>();
    store.register::<TimeStatus>();
    store.register::<NetworkStatus>();
    store.register::<NodeAddresses>();
    store.register::<MaintenanceServiceCerts>();
    store.register::<KubeletSpec>();
    store.register::<StaticPodStatus>();
    store.register::<Nodename>();
    store.register::<NodeStatus>();
    store.register::<EtcdSpec>();
}
