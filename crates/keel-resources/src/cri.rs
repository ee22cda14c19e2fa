//! Kinds in the `cri` namespace: image cache and registry configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::CRI_NAMESPACE;

/// Image cache state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageCacheStatus {
    /// Not yet evaluated.
    #[default]
    Unknown,
    /// Disabled, or no cache volume found.
    Disabled,
    /// A volume is ready but the local registry is not.
    Preparing,
    /// The local registry serves the cache.
    Ready,
}

/// State of copying the ISO cache onto the disk cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageCacheCopyStatus {
    /// Not yet evaluated.
    #[default]
    Unknown,
    /// Nothing to copy.
    Skipped,
    /// Copy in progress.
    Pending,
    /// Copy finished.
    Ready,
}

/// Image cache state and the directories serving it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCacheConfig {
    /// Overall state.
    pub status: ImageCacheStatus,
    /// ISO to disk copy state.
    pub copy_status: ImageCacheCopyStatus,
    /// Cache roots, most preferred first.
    pub roots: Vec<String>,
}
resource!(ImageCacheConfig, "ImageCacheConfigs.cri.keel.dev", CRI_NAMESPACE);

impl ImageCacheConfig {
    /// Singleton id.
    pub const ID: &'static str = "image-cache";
}

/// Mirror endpoints for one registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMirror {
    /// Endpoint URLs, tried in order.
    pub endpoints: Vec<String>,
    /// Use the endpoint path as-is.
    pub override_path: bool,
    /// Do not fall back to the upstream registry.
    pub skip_fallback: bool,
}

/// TLS settings for one registry endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTls {
    /// Skip verification.
    pub insecure_skip_verify: bool,
    /// CA bundle.
    pub ca: String,
    /// Client certificate.
    pub client_cert: String,
    /// Client key.
    pub client_key: String,
}

/// Credentials for one registry endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Pre-encoded auth.
    pub auth: String,
    /// Identity token.
    pub identity_token: String,
}

/// TLS and auth for one registry endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// TLS.
    pub tls: RegistryTls,
    /// Auth.
    pub auth: RegistryAuth,
}

/// Registry settings consumed by the container runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistriesConfig {
    /// Mirrors keyed by registry host.
    pub mirrors: BTreeMap<String, RegistryMirror>,
    /// TLS and auth keyed by endpoint host.
    pub config: BTreeMap<String, RegistryConfig>,
}
resource!(RegistriesConfig, "RegistriesConfigs.cri.keel.dev", CRI_NAMESPACE);

impl RegistriesConfig {
    /// Singleton id.
    pub const ID: &'static str = "registries";
}
