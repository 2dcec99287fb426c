use crate::logger::ActionLog;
use crate::pool::PoolAllocator;
use crate::provider_errors::{into_cpi, is_not_found};
use crate::provisioner::launch::InstanceLauncher;
use crate::provisioner::Provisioner;
use crate::settings::{CreatorKind, Settings};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use stratus_common::{ComputeInstance, CpiError, ProvisioningRequest};
use stratus_providers::ComputeProvider;

#[async_trait]
pub trait InstanceCreator: Send + Sync {
    async fn create(&self, request: &ProvisioningRequest) -> Result<ComputeInstance>;
}

#[async_trait]
pub trait InstanceDeleter: Send + Sync {
    async fn delete(&self, cid: i64) -> Result<()>;
}

#[async_trait]
impl InstanceCreator for Provisioner {
    async fn create(&self, request: &ProvisioningRequest) -> Result<ComputeInstance> {
        self.create_vm(request).await
    }
}

/// Deletes the instance at the provider once no transaction is running on
/// it. An instance the provider no longer knows counts as deleted.
pub struct VirtualGuestDeleter {
    launcher: Arc<InstanceLauncher>,
}

impl VirtualGuestDeleter {
    pub fn new(launcher: Arc<InstanceLauncher>) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl InstanceDeleter for VirtualGuestDeleter {
    async fn delete(&self, cid: i64) -> Result<()> {
        let log = ActionLog::start("DELETE_VM", cid.to_string());
        let provider = self.launcher.provider();
        let result = async {
            match self.launcher.wait_transactions_idle(cid).await {
                Err(e) if is_not_found(&e) => {
                    tracing::info!(cid, "vm already gone");
                    return Ok::<(), anyhow::Error>(());
                }
                other => other?,
            }
            match provider.delete_instance(cid).await {
                Ok(()) => Ok(()),
                Err(e) if is_not_found(&e) => {
                    tracing::info!(cid, "vm already gone");
                    Ok(())
                }
                Err(e) => Err(into_cpi(e, &format!("deleting vm {}", cid))),
            }
        }
        .await;
        log.finish(result)
    }
}

/// Returns the instance to the pool instead of deleting it.
pub struct PoolDeleter {
    allocator: Arc<PoolAllocator>,
}

impl PoolDeleter {
    pub fn new(allocator: Arc<PoolAllocator>) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl InstanceDeleter for PoolDeleter {
    async fn delete(&self, cid: i64) -> Result<()> {
        let log = ActionLog::start("RELEASE_VM", cid.to_string());
        let result = self.allocator.release(cid).await.map(|_| ());
        log.finish(result)
    }
}

/// Creator/deleter pair resolved once at startup.
pub struct Registry {
    kind: CreatorKind,
    creator: Arc<dyn InstanceCreator>,
    deleter: Arc<dyn InstanceDeleter>,
}

impl Registry {
    pub fn build(
        kind: CreatorKind,
        provisioner: Provisioner,
        launcher: Arc<InstanceLauncher>,
        allocator: Arc<PoolAllocator>,
    ) -> Self {
        let (creator, deleter): (Arc<dyn InstanceCreator>, Arc<dyn InstanceDeleter>) = match kind {
            CreatorKind::VirtualGuest => (
                Arc::new(provisioner),
                Arc::new(VirtualGuestDeleter::new(launcher)),
            ),
            CreatorKind::Pool => (
                Arc::new(provisioner.with_pool(allocator.clone())),
                Arc::new(PoolDeleter::new(allocator)),
            ),
        };
        tracing::info!(?kind, "creator registry built");
        Self {
            kind,
            creator,
            deleter,
        }
    }

    pub fn kind(&self) -> CreatorKind {
        self.kind
    }

    pub fn creator(&self) -> &Arc<dyn InstanceCreator> {
        &self.creator
    }

    pub fn deleter(&self) -> &Arc<dyn InstanceDeleter> {
        &self.deleter
    }
}

/// Provider implementation named by `STRATUS_PROVIDER`.
pub fn provider_for(settings: &Settings) -> Result<Arc<dyn ComputeProvider>> {
    match settings.provider.to_lowercase().as_str() {
        #[cfg(feature = "provider-mock")]
        "mock" => Ok(Arc::new(stratus_providers::mock::MockProvider::new())),
        other => Err(CpiError::Configuration(format!("unknown provider '{}'", other)).into()),
    }
}

