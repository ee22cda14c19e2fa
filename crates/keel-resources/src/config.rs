//! Kinds in the `config` namespace.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::{MachineConfigDocument, MachineKind};
use crate::CONFIG_NAMESPACE;

/// A decoded machine configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// The document.
    pub document: Arc<MachineConfigDocument>,
}
resource!(MachineConfig, "MachineConfigs.config.keel.dev", CONFIG_NAMESPACE);

impl MachineConfig {
    /// Id of the configuration in effect.
    pub const ACTIVE_ID: &'static str = "v1alpha1";
    /// Id of configuration received over the maintenance API.
    pub const MAINTENANCE_ID: &'static str = "maintenance";

    /// Wraps a document.
    pub fn new(document: MachineConfigDocument) -> Self {
        Self {
            document: Arc::new(document),
        }
    }
}

/// The machine role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineType {
    /// Role.
    pub kind: MachineKind,
}
resource!(MachineType, "MachineTypes.config.keel.dev", CONFIG_NAMESPACE);

impl MachineType {
    /// Singleton id.
    pub const ID: &'static str = "machine-type";
}
