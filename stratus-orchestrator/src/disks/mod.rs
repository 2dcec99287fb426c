use crate::logger::ActionLog;
use crate::poller::Poller;
use crate::provider_errors::into_cpi;
use crate::settings::Settings;
use anyhow::Result;
use std::sync::Arc;
use stratus_common::{CpiError, Volume};
use stratus_providers::{AgentEnvStore, ComputeProvider, RemoteCommand};

pub mod attach;
pub mod devices;
pub mod iscsi;

/// Capacities (GB) the provider sells block volumes in.
pub const VOLUME_SIZES_GB: [i64; 11] = [20, 40, 80, 100, 250, 500, 1000, 2000, 4000, 8000, 12000];

/// Smallest sellable capacity holding `size_mb`.
pub fn volume_size_gb(size_mb: i64) -> Result<i64, CpiError> {
    if size_mb <= 0 {
        return Err(CpiError::ProviderRejected(format!(
            "disk size must be positive, got {} MB",
            size_mb
        )));
    }
    let wanted_gb = (size_mb + 1023) / 1024;
    VOLUME_SIZES_GB
        .iter()
        .copied()
        .find(|gb| *gb >= wanted_gb)
        .ok_or_else(|| {
            CpiError::ProviderRejected(format!(
                "no volume size holds {} GB (largest is {} GB)",
                wanted_gb,
                VOLUME_SIZES_GB[VOLUME_SIZES_GB.len() - 1]
            ))
        })
}

/// Network block storage lifecycle plus attach/detach on running instances.
///
/// Concurrent attach/detach calls against the same instance race on the
/// instance's iSCSI state and must be serialized by the caller.
pub struct DiskManager {
    provider: Arc<dyn ComputeProvider>,
    remote: Arc<dyn RemoteCommand>,
    agent_env_store: Arc<dyn AgentEnvStore>,
    settings: Arc<Settings>,
}

impl DiskManager {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        remote: Arc<dyn RemoteCommand>,
        agent_env_store: Arc<dyn AgentEnvStore>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            provider,
            remote,
            agent_env_store,
            settings,
        }
    }

    pub async fn create_disk(&self, size_mb: i64, datacenter: &str, iops: Option<i64>) -> Result<Volume> {
        let log = ActionLog::start("CREATE_DISK", format!("{} MB in {}", size_mb, datacenter));
        let result = async {
            let size_gb = volume_size_gb(size_mb)?;
            let order_id = self
                .provider
                .order_volume(datacenter, size_gb, iops)
                .await
                .map_err(|e| into_cpi(e, &format!("ordering {} GB volume", size_gb)))?;
            tracing::info!(order_id, size_gb, datacenter, "volume ordered");

            let provider = &self.provider;
            let volume = Poller::from(self.settings.timeouts.volume_ready)
                .poll(&format!("volume of order {} in inventory", order_id), || async move {
                    provider.find_volume_by_order(order_id).await
                })
                .await?;
            tracing::info!(volume_id = volume.id, order_id, "volume provisioned");
            Ok::<_, anyhow::Error>(volume)
        }
        .await;
        log.finish(result)
    }

    pub async fn delete_disk(&self, volume_id: i64) -> Result<()> {
        let log = ActionLog::start("DELETE_DISK", volume_id.to_string());
        let result = self
            .provider
            .cancel_volume(volume_id)
            .await
            .map_err(|e| into_cpi(e, &format!("cancelling volume {}", volume_id)));
        log.finish(result)
    }
}
