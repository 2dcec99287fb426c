use crate::poller::Poller;
use crate::provider_errors::into_cpi;
use crate::settings::Timeouts;
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use stratus_common::{ComputeInstance, InstanceTemplate};
use stratus_providers::ComputeProvider;

/// Provider-side halves of the fresh-create and reuse-by-reload strategies.
/// Shared by the provisioner and the pool allocator.
pub struct InstanceLauncher {
    provider: Arc<dyn ComputeProvider>,
    timeouts: Timeouts,
}

impl InstanceLauncher {
    pub fn new(provider: Arc<dyn ComputeProvider>, timeouts: Timeouts) -> Self {
        Self { provider, timeouts }
    }

    pub fn provider(&self) -> &Arc<dyn ComputeProvider> {
        &self.provider
    }

    pub async fn fresh_create(&self, template: &InstanceTemplate) -> Result<ComputeInstance> {
        let id = self
            .provider
            .create_instance(template)
            .await
            .map_err(|e| into_cpi(e, "creating virtual guest"))?;
        tracing::info!(cid = id, hostname = %template.hostname, "virtual guest ordered");

        let provider = &self.provider;
        Poller::from(self.timeouts.instance_ready)
            .wait_until(&format!("vm {} running with no pending transaction", id), || async move {
                if !provider.power_state(id).await?.is_running() {
                    return Ok(false);
                }
                Ok(provider
                    .last_transaction(id)
                    .await?
                    .map_or(true, |t| t.is_complete()))
            })
            .await?;

        self.provider
            .get_instance(id)
            .await
            .map_err(|e| into_cpi(e, &format!("virtual guest {}", id)))
    }

    /// Finds the instance holding `ip`, then reloads it with `stemcell_id`.
    pub async fn reuse_by_address(&self, ip: IpAddr, stemcell_id: i64) -> Result<ComputeInstance> {
        let addr = ip.to_string();
        let found = if is_backend_address(&ip) {
            self.provider.find_instance_by_backend_ip(&addr).await
        } else {
            self.provider.find_instance_by_primary_ip(&addr).await
        };
        let instance = found.map_err(|e| into_cpi(e, &format!("virtual guest with address {}", addr)))?;
        tracing::info!(cid = instance.id, ip = %addr, "reusing virtual guest");
        self.reload(instance.id, stemcell_id).await
    }

    /// OS reload protocol: idle, submit, observe start, observe completion.
    pub async fn reload(&self, id: i64, stemcell_id: i64) -> Result<ComputeInstance> {
        let provider = &self.provider;

        self.wait_transactions_idle(id).await?;

        provider
            .reload_instance(id, stemcell_id)
            .await
            .map_err(|e| into_cpi(e, &format!("reloading virtual guest {}", id)))?;
        tracing::info!(cid = id, stemcell_id, "os reload submitted");

        let reload = Poller::from(self.timeouts.os_reload);
        reload
            .wait_until(&format!("os reload of vm {} to start", id), || async move {
                Ok(!provider.active_transactions(id).await?.is_empty())
            })
            .await?;
        reload
            .wait_until(&format!("os reload of vm {} to finish", id), || async move {
                if !provider.active_transactions(id).await?.is_empty() {
                    return Ok(false);
                }
                Ok(provider.power_state(id).await?.is_running())
            })
            .await?;
        tracing::info!(cid = id, "os reload finished");

        provider
            .get_instance(id)
            .await
            .with_context(|| format!("fetching virtual guest {} after reload", id))
    }

    pub async fn wait_transactions_idle(&self, id: i64) -> Result<()> {
        let provider = &self.provider;
        Poller::from(self.timeouts.transaction_idle)
            .wait_until(&format!("vm {} to have no active transaction", id), || async move {
                Ok(provider.active_transactions(id).await?.is_empty())
            })
            .await
    }
}

/// Private-range IPv4 addresses live on the backend network.
pub fn is_backend_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stratus_common::{error_kind, ErrorKind, ResourceProfile, StemcellRef};
    use stratus_providers::mock::{MockCall, MockProvider};

    fn launcher(provider: Arc<MockProvider>) -> InstanceLauncher {
        InstanceLauncher::new(
            provider,
            Timeouts::uniform(Duration::from_secs(60), Duration::from_secs(1)),
        )
    }

    fn template() -> InstanceTemplate {
        InstanceTemplate::from_profile(
            &ResourceProfile {
                cpu: 1,
                memory_mb: 1024,
                private_vlan_id: 10,
                public_vlan_id: 20,
                vm_name_prefix: "bosh".into(),
                domain: "example.com".into(),
                ..Default::default()
            },
            &StemcellRef {
                id: 77,
                uuid: "stemcell-uuid".into(),
            },
        )
    }

    #[test]
    fn address_classes() {
        assert!(is_backend_address(&"10.1.2.3".parse().unwrap()));
        assert!(is_backend_address(&"192.168.0.9".parse().unwrap()));
        assert!(!is_backend_address(&"169.50.1.2".parse().unwrap()));
        assert!(!is_backend_address(&"2001:db8::1".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_create_waits_until_running() {
        let provider = Arc::new(MockProvider::with_first_id(501));
        let inst = launcher(provider.clone()).fresh_create(&template()).await.unwrap();
        assert_eq!(inst.id, 501);
        assert_eq!(inst.fqdn, "bosh.example.com");
        assert_eq!(provider.create_count(), 1);
        assert_eq!(provider.reload_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_looks_up_by_backend_address_then_reloads() {
        let provider = Arc::new(MockProvider::with_first_id(501));
        let seeded = MockProvider::instance_for(501, &template());
        provider.seed_instance(seeded.clone());
        provider.set_reload_busy_polls(3);

        let inst = launcher(provider.clone())
            .reuse_by_address(seeded.primary_backend_ip.parse().unwrap(), 77)
            .await
            .unwrap();
        assert_eq!(inst.id, 501);
        assert_eq!(provider.create_count(), 0);

        let calls = provider.calls();
        assert!(calls.contains(&MockCall::FindByBackendIp(seeded.primary_backend_ip.clone())));
        assert!(calls.contains(&MockCall::ReloadInstance {
            id: 501,
            stemcell_id: 77
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_address_is_not_found() {
        let provider = Arc::new(MockProvider::new());
        let err = launcher(provider)
            .reuse_by_address("169.50.9.9".parse().unwrap(), 77)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_that_never_starts_times_out() {
        let provider = Arc::new(MockProvider::new());
        provider.seed_instance(MockProvider::instance_for(9, &template()));
        provider.set_reload_busy_polls(0);

        let err = launcher(provider).reload(9, 77).await.unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::Timeout));
        assert!(err.to_string().contains("to start"));
    }
}
