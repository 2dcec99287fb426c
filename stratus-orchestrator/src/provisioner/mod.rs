use crate::logger::ActionLog;
use crate::pool::PoolAllocator;
use crate::provider_errors::into_cpi;
use crate::settings::{CreatorKind, Settings};
use anyhow::Result;
use std::sync::Arc;
use stratus_common::{ComputeInstance, CpiError, InstanceTemplate, ProvisioningRequest};
use stratus_providers::{AgentEnvStore, ComputeProvider, RemoteCommand};

pub mod launch;
pub mod mbus;
pub mod post_config;
pub mod strategy;

use launch::InstanceLauncher;
use post_config::PostConfig;
pub use strategy::{select_strategy, Strategy};

pub struct Provisioner {
    launcher: Arc<InstanceLauncher>,
    remote: Arc<dyn RemoteCommand>,
    agent_env_store: Arc<dyn AgentEnvStore>,
    settings: Arc<Settings>,
    creator: CreatorKind,
    pool: Option<Arc<PoolAllocator>>,
}

impl Provisioner {
    pub fn new(
        launcher: Arc<InstanceLauncher>,
        remote: Arc<dyn RemoteCommand>,
        agent_env_store: Arc<dyn AgentEnvStore>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            launcher,
            remote,
            agent_env_store,
            settings,
            creator: CreatorKind::VirtualGuest,
            pool: None,
        }
    }

    /// Route no-address requests through the pool.
    pub fn with_pool(mut self, pool: Arc<PoolAllocator>) -> Self {
        self.creator = CreatorKind::Pool;
        self.pool = Some(pool);
        self
    }

    fn provider(&self) -> &dyn ComputeProvider {
        self.launcher.provider().as_ref()
    }

    pub async fn create_vm(&self, request: &ProvisioningRequest) -> Result<ComputeInstance> {
        let log = ActionLog::start("CREATE_VM", request.agent_id.as_str());
        let result = self.create_vm_inner(request).await;
        log.finish(result)
    }

    async fn create_vm_inner(&self, request: &ProvisioningRequest) -> Result<ComputeInstance> {
        let strategy = select_strategy(request, self.creator, self.settings.disable_os_reload)?;

        let instance = match strategy {
            Strategy::FreshCreate => {
                let template = InstanceTemplate::from_profile(&request.profile, &request.stemcell);
                self.launcher.fresh_create(&template).await?
            }
            Strategy::ReuseByReload { ip } => {
                self.launcher
                    .reuse_by_address(ip, request.stemcell.id)
                    .await?
            }
            Strategy::Pool => {
                let pool = self.pool.as_ref().ok_or_else(|| {
                    CpiError::Configuration("pool creator selected without a pool".into())
                })?;
                pool.allocate(request).await?.instance
            }
        };

        PostConfig {
            provider: self.provider(),
            remote: self.remote.as_ref(),
            agent_env_store: self.agent_env_store.as_ref(),
            settings: &self.settings,
        }
        .apply(&instance, request)
        .await?;

        tracing::info!(cid = instance.id, agent_id = %request.agent_id, ?strategy, "vm ready");
        Ok(instance)
    }
}

/// Replaces the provider-side tags of `cid`.
pub async fn set_vm_metadata(provider: &dyn ComputeProvider, cid: i64, tags: &[String]) -> Result<()> {
    let log = ActionLog::start("SET_VM_METADATA", cid.to_string());
    let result = provider
        .set_tags(cid, tags)
        .await
        .map_err(|e| into_cpi(e, &format!("tagging vm {}", cid)));
    log.finish(result)
}
