use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::NetworkSpec;

pub const SYSTEM_DISK_PATH: &str = "/dev/xvda";
pub const EPHEMERAL_DISK_PATH: &str = "/dev/xvdc";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VmSpec {
    pub name: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct BlobstoreOptions {
    pub provider: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DisksSpec {
    #[serde(default)]
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<String>,
    /// Volume id -> device path.
    #[serde(default)]
    pub persistent: BTreeMap<String, String>,
}

impl DisksSpec {
    pub fn for_ephemeral_size(ephemeral_disk_size: i64) -> Self {
        Self {
            system: SYSTEM_DISK_PATH.to_string(),
            ephemeral: (ephemeral_disk_size > 0).then(|| EPHEMERAL_DISK_PATH.to_string()),
            persistent: BTreeMap::new(),
        }
    }
}

/// Configuration document read by the on-instance agent.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AgentEnv {
    pub agent_id: String,
    pub vm: VmSpec,
    pub mbus: String,
    #[serde(default)]
    pub ntp: Vec<String>,
    #[serde(default)]
    pub blobstore: BlobstoreOptions,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkSpec>,
    #[serde(default)]
    pub disks: DisksSpec,
    #[serde(default)]
    pub env: serde_json::Value,
}

impl AgentEnv {
    pub fn attach_persistent_disk(mut self, volume_id: &str, device_path: &str) -> Self {
        self.disks
            .persistent
            .insert(volume_id.to_string(), device_path.to_string());
        self
    }

    pub fn detach_persistent_disk(mut self, volume_id: &str) -> Self {
        self.disks.persistent.remove(volume_id);
        self
    }
}
