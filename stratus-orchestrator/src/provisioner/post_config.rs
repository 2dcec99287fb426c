use super::mbus;
use crate::disks::iscsi;
use crate::provider_errors::{classify, into_cpi, ProviderFailure};
use crate::settings::Settings;
use anyhow::{Context, Result};
use std::net::IpAddr;
use stratus_common::{
    AgentEnv, BlobstoreOptions, ComputeInstance, CpiError, DisksSpec, NetworkType,
    ProvisioningRequest, VmSpec,
};
use stratus_providers::{AgentEnvStore, ComputeProvider, RemoteCommand};

pub struct PostConfig<'a> {
    pub provider: &'a dyn ComputeProvider,
    pub remote: &'a dyn RemoteCommand,
    pub agent_env_store: &'a dyn AgentEnvStore,
    pub settings: &'a Settings,
}

impl PostConfig<'_> {
    /// Steps after the instance exists, in order. Each one is a hard failure
    /// point; nothing done before is rolled back.
    pub async fn apply(&self, instance: &ComputeInstance, request: &ProvisioningRequest) -> Result<AgentEnv> {
        self.attach_ephemeral_disk(instance, request.profile.ephemeral_disk_size)
            .await?;

        let backend_ip: IpAddr = instance.primary_backend_ip.parse().map_err(|_| {
            CpiError::ProviderRejected(format!(
                "vm {} reports an invalid backend address '{}'",
                instance.id, instance.primary_backend_ip
            ))
        })?;
        let bus_ip = match request.profile.mbus_override_ip {
            Some(ip) => {
                mbus::record_host(&self.settings.hosts_file, &instance.primary_backend_ip, &instance.fqdn)
                    .await?;
                ip
            }
            None => backend_ip,
        };

        let env = build_agent_env(self.settings, instance, request, &bus_ip)?;
        self.agent_env_store
            .update(instance, &env)
            .await
            .with_context(|| format!("pushing agent settings of vm {}", instance.id))?;

        if let Some(password) = &self.settings.agent.vcap_password {
            let command = iscsi::set_vcap_password(password);
            self.remote
                .exec(
                    &self.settings.ssh_user,
                    &instance.root.password,
                    &instance.primary_backend_ip,
                    &command,
                )
                .await
                .with_context(|| format!("setting vcap password on vm {}", instance.id))?;
        }
        Ok(env)
    }

    async fn attach_ephemeral_disk(&self, instance: &ComputeInstance, size_gb: i64) -> Result<()> {
        if size_gb <= 0 {
            return Ok(());
        }
        match self.provider.attach_ephemeral_disk(instance.id, size_gb).await {
            Ok(()) => {
                tracing::info!(cid = instance.id, size_gb, "ephemeral disk ordered");
                Ok(())
            }
            Err(e) if classify(&e) == ProviderFailure::UpgradePending => {
                tracing::info!(cid = instance.id, size_gb, "ephemeral disk upgrade already pending");
                Ok(())
            }
            Err(e) => Err(into_cpi(e, &format!("ephemeral disk for vm {}", instance.id))),
        }
    }
}

pub fn build_agent_env(
    settings: &Settings,
    instance: &ComputeInstance,
    request: &ProvisioningRequest,
    bus_ip: &IpAddr,
) -> Result<AgentEnv, CpiError> {
    let mut networks = request.networks_by_name();
    for net in networks.values_mut() {
        if net.kind == NetworkType::Dynamic && net.ip.is_none() {
            net.ip = instance.primary_backend_ip.parse().ok();
        }
    }

    let mut blobstore = BlobstoreOptions {
        provider: settings.agent.blobstore_provider.clone(),
        options: serde_json::Map::new(),
    };
    if let Some(endpoint) = &settings.agent.blobstore_endpoint {
        let endpoint = match request.profile.mbus_override_ip {
            Some(ip) if blobstore.provider == "dav" => mbus::rewrite_host(endpoint, &ip)?,
            _ => endpoint.clone(),
        };
        blobstore
            .options
            .insert("endpoint".to_string(), serde_json::Value::String(endpoint));
    }

    Ok(AgentEnv {
        agent_id: request.agent_id.clone(),
        vm: VmSpec {
            name: format!("vm-{}", request.agent_id),
            id: instance.id.to_string(),
        },
        mbus: mbus::rewrite_host(&settings.agent.mbus, bus_ip)?,
        ntp: settings.agent.ntp.clone(),
        blobstore,
        networks,
        disks: DisksSpec::for_ephemeral_size(request.profile.ephemeral_disk_size),
        env: request.env.clone(),
    })
}
