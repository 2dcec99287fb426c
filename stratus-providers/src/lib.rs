use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use stratus_common::{
    AgentEnv, AllowedHost, ComputeInstance, InstanceTemplate, PowerState, Transaction, Volume,
};

/// Raw failure reported by the compute provider API.
///
/// Providers never decide whether a failure is "not found", "rejected" or
/// "transient"; they only surface what the API said. Callers classify.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider API error (status {status}, code {code}): {message}")]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Submit an order for a fresh instance. Returns the provider-assigned id
    /// as soon as the order is accepted; the instance is not ready yet.
    async fn create_instance(&self, template: &InstanceTemplate) -> Result<i64>;

    async fn get_instance(&self, id: i64) -> Result<ComputeInstance>;

    // Lookup by address: backend (private subnet) vs primary (public subnet).
    async fn find_instance_by_backend_ip(&self, ip: &str) -> Result<ComputeInstance>;
    async fn find_instance_by_primary_ip(&self, ip: &str) -> Result<ComputeInstance>;

    async fn delete_instance(&self, id: i64) -> Result<()>;

    /// Re-image an instance in place with the given image template id.
    async fn reload_instance(&self, id: i64, stemcell_id: i64) -> Result<()>;

    async fn power_state(&self, id: i64) -> Result<PowerState>;
    async fn active_transactions(&self, id: i64) -> Result<Vec<Transaction>>;
    async fn last_transaction(&self, id: i64) -> Result<Option<Transaction>>;

    /// Order an upgrade adding a local disk of `size_gb`.
    async fn attach_ephemeral_disk(&self, id: i64, size_gb: i64) -> Result<()>;

    async fn set_tags(&self, id: i64, tags: &[String]) -> Result<()>;

    // Network block storage.
    async fn order_volume(&self, datacenter: &str, size_gb: i64, iops: Option<i64>) -> Result<i64>;
    /// Volume produced by an order, once it shows up in the account inventory.
    async fn find_volume_by_order(&self, order_id: i64) -> Result<Option<Volume>>;
    async fn get_volume(&self, id: i64) -> Result<Volume>;
    async fn cancel_volume(&self, id: i64) -> Result<()>;

    /// Returns false while the volume is busy and cannot take the change yet.
    async fn authorize_host(&self, instance_id: i64, volume_id: i64) -> Result<bool>;
    async fn deauthorize_host(&self, instance_id: i64, volume_id: i64) -> Result<bool>;
    async fn allowed_host(&self, instance_id: i64) -> Result<AllowedHost>;
}

/// Synchronous command channel to an instance.
#[async_trait]
pub trait RemoteCommand: Send + Sync {
    async fn exec(&self, user: &str, password: &str, host: &str, command: &str) -> Result<String>;

    async fn upload(
        &self,
        user: &str,
        password: &str,
        host: &str,
        local_file: &Path,
        remote_path: &str,
    ) -> Result<()>;
}

/// Where the on-instance agent reads its configuration document from.
#[async_trait]
pub trait AgentEnvStore: Send + Sync {
    async fn fetch(&self, instance: &ComputeInstance) -> Result<AgentEnv>;
    async fn update(&self, instance: &ComputeInstance, env: &AgentEnv) -> Result<()>;
}

pub mod registry;
pub mod ssh;

#[cfg(feature = "mock")]
pub mod mock;
