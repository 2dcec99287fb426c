use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

pub mod agent_env;
pub mod error;

pub use agent_env::{AgentEnv, BlobstoreOptions, DisksSpec, VmSpec};
pub use error::{error_kind, CpiError, ErrorKind};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Dynamic, // Address assigned by the provider
    Manual,  // Address chosen by the caller
    Vip,     // Floating address (unsupported)
}

/// Pool membership state, persisted as `'f'` / `'t'` in the `in_use` column.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    #[sqlx(rename = "f")]
    Free,
    #[sqlx(rename = "t")]
    Using,
}

impl PoolState {
    pub fn as_flag(&self) -> &'static str {
        match self {
            PoolState::Free => "f",
            PoolState::Using => "t",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Halted,
    Paused,
    Other(String),
}

impl PowerState {
    pub fn from_key_name(key: &str) -> Self {
        match key.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => PowerState::Running,
            "HALTED" => PowerState::Halted,
            "PAUSED" => PowerState::Paused,
            other => PowerState::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PowerState::Running)
    }
}

// --- Request side ---

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct NetworkCloudProperties {
    #[serde(default)]
    pub vlan_id: i64,
    #[serde(default)]
    pub source_policy_routing: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NetworkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,
    #[serde(default)]
    pub cloud_properties: NetworkCloudProperties,
}

impl NetworkSpec {
    pub fn vlan_id(&self) -> i64 {
        self.cloud_properties.vlan_id
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StemcellRef {
    /// Numeric image template id, used for OS reloads.
    pub id: i64,
    /// Global identifier, used for fresh creates.
    pub uuid: String,
}

/// Resource profile of a provisioning request (the provider's "cloud properties").
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ResourceProfile {
    pub cpu: i64,
    pub memory_mb: i64,
    /// Size in GB of the additional local disk; 0 disables it.
    #[serde(default)]
    pub ephemeral_disk_size: i64,
    pub private_vlan_id: i64,
    pub public_vlan_id: i64,
    #[serde(default)]
    pub ssh_keys: Vec<i64>,
    #[serde(default)]
    pub vm_name_prefix: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub hourly_billing: bool,
    #[serde(default)]
    pub local_disk: bool,
    #[serde(default)]
    pub dedicated_host_only: bool,
    #[serde(default)]
    pub private_network_only: bool,
    #[serde(default)]
    pub disable_os_reload: bool,
    /// External management address; when set the bus endpoint points here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbus_override_ip: Option<IpAddr>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProvisioningRequest {
    pub agent_id: String,
    pub stemcell: StemcellRef,
    pub profile: ResourceProfile,
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub env: serde_json::Value,
}

impl ProvisioningRequest {
    pub fn networks_by_name(&self) -> BTreeMap<String, NetworkSpec> {
        self.networks
            .iter()
            .map(|n| (n.name.clone(), n.clone()))
            .collect()
    }
}

// --- Provider entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ComputeInstance {
    pub id: i64,
    pub datacenter_id: i64,
    pub primary_ip: Option<String>,
    pub primary_backend_ip: String,
    pub fqdn: String,
    pub cpu: i64,
    pub memory_mb: i64,
    pub private_vlan_id: i64,
    pub public_vlan_id: i64,
    /// Root account credential, used by the remote command channel.
    pub root: Credential,
}

/// Order payload for a fresh instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceTemplate {
    pub hostname: String,
    pub domain: String,
    pub start_cpus: i64,
    pub max_memory_mb: i64,
    pub datacenter: String,
    pub image_global_identifier: String,
    pub hourly_billing: bool,
    pub dedicated_host_only: bool,
    pub private_network_only: bool,
    pub local_disk: bool,
    pub ssh_key_ids: Vec<i64>,
    pub nic_max_speed_mbps: i64,
    pub public_vlan_id: i64,
    pub private_vlan_id: i64,
}

impl InstanceTemplate {
    pub fn from_profile(profile: &ResourceProfile, stemcell: &StemcellRef) -> Self {
        Self {
            hostname: profile.vm_name_prefix.clone(),
            domain: profile.domain.clone(),
            start_cpus: profile.cpu,
            max_memory_mb: profile.memory_mb,
            datacenter: profile.datacenter.clone(),
            image_global_identifier: stemcell.uuid.clone(),
            hourly_billing: profile.hourly_billing,
            dedicated_host_only: profile.dedicated_host_only,
            private_network_only: profile.private_network_only,
            local_disk: profile.local_disk,
            ssh_key_ids: profile.ssh_keys.clone(),
            nic_max_speed_mbps: 1000,
            public_vlan_id: profile.public_vlan_id,
            private_vlan_id: profile.private_vlan_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: i64,
    pub group: String,
    pub status: String,
}

impl Transaction {
    pub fn is_complete(&self) -> bool {
        self.status.to_ascii_lowercase().contains("complete")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: i64,
    pub capacity_gb: i64,
    pub iops: Option<i64>,
    /// iSCSI portal on the backend network.
    pub backend_ip: String,
    pub credential: Credential,
    pub allowed_hosts: Vec<i64>,
}

/// Host authorization entry on the storage side: the initiator name the
/// instance must present plus the CHAP credential it must use.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AllowedHost {
    pub name: Option<String>,
    pub credential: Credential,
}

// --- Pool ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PoolRecord {
    #[sqlx(rename = "id")]
    pub cid: i64,
    #[sqlx(rename = "name")]
    pub hostname: String,
    #[sqlx(rename = "in_use")]
    pub state: PoolState,
    pub cpu: i64,
    pub memory_mb: i64,
    pub ip: String,
    pub private_vlan: i64,
    pub public_vlan: i64,
    pub image_id: String,
    pub agent_id: String,
}

/// Shape a Free record must have to satisfy an allocation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolFilter {
    pub cpu: i64,
    pub memory_mb: i64,
    pub private_vlan: i64,
    pub public_vlan: i64,
}

impl From<&ResourceProfile> for PoolFilter {
    fn from(p: &ResourceProfile) -> Self {
        Self {
            cpu: p.cpu,
            memory_mb: p.memory_mb,
            private_vlan: p.private_vlan_id,
            public_vlan: p.public_vlan_id,
        }
    }
}

impl PoolRecord {
    pub fn from_instance(instance: &ComputeInstance, state: PoolState) -> Self {
        Self {
            cid: instance.id,
            hostname: instance.fqdn.clone(),
            state,
            cpu: instance.cpu,
            memory_mb: instance.memory_mb,
            ip: instance.primary_backend_ip.clone(),
            private_vlan: instance.private_vlan_id,
            public_vlan: instance.public_vlan_id,
            image_id: String::new(),
            agent_id: String::new(),
        }
    }
}
