//! Maintenance API messages.

/// How an applied configuration takes effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ApplyMode {
    /// Reboot.
    Reboot = 0,
    /// Apply without reboot when possible.
    Auto = 1,
    /// Apply now, fall back to reboot.
    NoReboot = 2,
    /// Apply after the next reboot.
    Staged = 3,
    /// Apply temporarily and roll back unless confirmed.
    Try = 4,
}

/// Request to apply a machine configuration.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplyConfigurationRequest {
    /// Configuration document (YAML or JSON).
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    /// Apply mode.
    #[prost(enumeration = "ApplyMode", tag = "4")]
    pub mode: i32,
    /// Validate only.
    #[prost(bool, tag = "5")]
    pub dry_run: bool,
}

/// Result of applying a configuration.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ApplyConfigurationResponse {
    /// Mode actually used.
    #[prost(enumeration = "ApplyMode", tag = "1")]
    pub mode: i32,
    /// Human readable summary.
    #[prost(string, tag = "2")]
    pub mode_details: String,
}

/// Software version report.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VersionResponse {
    /// Release tag.
    #[prost(string, tag = "1")]
    pub tag: String,
    /// Source revision.
    #[prost(string, tag = "2")]
    pub sha: String,
    /// Target architecture.
    #[prost(string, tag = "3")]
    pub arch: String,
}

/// Writes a meta partition key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetaWriteRequest {
    /// Key; must fit in a byte.
    #[prost(uint32, tag = "1")]
    pub key: u32,
    /// Value.
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Deletes a meta partition key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetaDeleteRequest {
    /// Key; must fit in a byte.
    #[prost(uint32, tag = "1")]
    pub key: u32,
}
