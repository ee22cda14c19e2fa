//! Kinds in the `block` namespace: volume location, status and mounts.

use keel_expr::Expression;
use serde::{Deserialize, Serialize};

use crate::BLOCK_NAMESPACE;

/// How a volume is provided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeType {
    /// A partition on a disk.
    #[default]
    Partition,
    /// A whole disk, e.g. a CD-ROM image.
    Disk,
    /// A directory on another volume.
    Directory,
}

/// Filesystem detected on a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    /// Not detected.
    #[default]
    Unknown,
    /// XFS.
    Xfs,
    /// ext4.
    Ext4,
    /// VFAT.
    Vfat,
    /// ISO 9660.
    Iso9660,
}

impl FilesystemType {
    /// Name as reported by blkid.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemType::Unknown => "unknown",
            FilesystemType::Xfs => "xfs",
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Vfat => "vfat",
            FilesystemType::Iso9660 => "iso9660",
        }
    }
}

/// Lifecycle of a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumePhase {
    /// Waiting for discovery.
    #[default]
    Waiting,
    /// Discovery finished and nothing matched.
    Missing,
    /// Matched a device.
    Located,
    /// Formatted and ready to mount.
    Ready,
    /// Failed.
    Failed,
}

/// Matches a discovered volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocatorSpec {
    /// Boolean expression over `volume`.
    pub matcher: Option<Expression>,
}

/// Where a volume is mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Target directory.
    pub target_path: String,
}

/// Describes how to find and mount a volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume type.
    pub volume_type: VolumeType,
    /// Locator.
    pub locator: LocatorSpec,
    /// Mount settings.
    pub mount: MountSpec,
}
resource!(VolumeConfig, "VolumeConfigs.block.keel.dev", BLOCK_NAMESPACE);

/// Observed state of a configured volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    /// Phase.
    pub phase: VolumePhase,
    /// Detected filesystem.
    pub filesystem: FilesystemType,
    /// Device path.
    pub location: String,
    /// Filesystem label.
    pub label: String,
    /// Partition label.
    pub partition_label: String,
}
resource!(VolumeStatus, "VolumeStatuses.block.keel.dev", BLOCK_NAMESPACE);

/// Asks the volume manager to mount a volume for a requester.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMountRequest {
    /// Volume to mount.
    pub volume_id: String,
    /// Requesting controller.
    pub requester: String,
    /// Mount read-only.
    pub read_only: bool,
}
resource!(VolumeMountRequest, "VolumeMountRequests.block.keel.dev", BLOCK_NAMESPACE);

/// A fulfilled mount request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMountStatus {
    /// Mounted volume.
    pub volume_id: String,
    /// Requesting controller.
    pub requester: String,
    /// Mount target.
    pub target: String,
    /// Mounted read-only.
    pub read_only: bool,
}
resource!(VolumeMountStatus, "VolumeMountStatuses.block.keel.dev", BLOCK_NAMESPACE);
