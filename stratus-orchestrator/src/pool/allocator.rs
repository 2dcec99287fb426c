use super::{PoolReservation, PoolStore, VmUpdate};
use crate::provider_errors::into_cpi;
use crate::provisioner::launch::InstanceLauncher;
use anyhow::{Context, Result};
use std::sync::Arc;
use stratus_common::{
    ComputeInstance, InstanceTemplate, PoolFilter, PoolRecord, PoolState, ProvisioningRequest,
};

#[derive(Debug, Clone)]
pub struct Allocation {
    pub record: PoolRecord,
    pub instance: ComputeInstance,
    /// True when nothing in the pool matched and a new instance was ordered.
    pub fresh: bool,
}

pub struct PoolAllocator {
    store: PoolStore,
    reservation: Arc<dyn PoolReservation>,
    launcher: Arc<InstanceLauncher>,
}

impl PoolAllocator {
    pub fn new(
        store: PoolStore,
        reservation: Arc<dyn PoolReservation>,
        launcher: Arc<InstanceLauncher>,
    ) -> Self {
        Self {
            store,
            reservation,
            launcher,
        }
    }

    pub async fn allocate(&self, request: &ProvisioningRequest) -> Result<Allocation> {
        let filter = PoolFilter::from(&request.profile);
        let claimed = self
            .reservation
            .reserve(&filter, &request.agent_id)
            .await
            .context("reserving pool vm")?;

        match claimed {
            None => {
                let template = InstanceTemplate::from_profile(&request.profile, &request.stemcell);
                let instance = self.launcher.fresh_create(&template).await?;
                let record = PoolRecord {
                    cid: instance.id,
                    hostname: instance.fqdn.clone(),
                    state: PoolState::Using,
                    cpu: filter.cpu,
                    memory_mb: filter.memory_mb,
                    ip: instance.primary_backend_ip.clone(),
                    private_vlan: filter.private_vlan,
                    public_vlan: filter.public_vlan,
                    image_id: request.stemcell.uuid.clone(),
                    agent_id: request.agent_id.clone(),
                };
                self.store
                    .insert(&record)
                    .await
                    .with_context(|| format!("registering vm {} in pool", instance.id))?;
                tracing::info!(cid = instance.id, agent_id = %request.agent_id, "pool grown with fresh vm");
                Ok(Allocation {
                    record,
                    instance,
                    fresh: true,
                })
            }
            Some(mut record) => {
                let instance = self
                    .launcher
                    .reload(record.cid, request.stemcell.id)
                    .await
                    .with_context(|| format!("reloading pool vm {}", record.cid))?;
                let changes = VmUpdate {
                    state: Some(PoolState::Using),
                    image_id: Some(request.stemcell.uuid.clone()),
                    agent_id: Some(request.agent_id.clone()),
                };
                self.store.update(record.cid, &changes).await?;
                record.state = PoolState::Using;
                record.image_id = request.stemcell.uuid.clone();
                record.agent_id = request.agent_id.clone();
                tracing::info!(cid = record.cid, agent_id = %request.agent_id, "pool vm reused");
                Ok(Allocation {
                    record,
                    instance,
                    fresh: false,
                })
            }
        }
    }

    /// Returns `cid` to the pool. Never deletes the instance. An instance the
    /// pool has no record of is registered as Free.
    pub async fn release(&self, cid: i64) -> Result<PoolRecord> {
        match self.reservation.lookup(cid).await? {
            Some(mut record) => {
                if record.state != PoolState::Free {
                    self.store.update(cid, &VmUpdate::state(PoolState::Free)).await?;
                    record.state = PoolState::Free;
                }
                tracing::info!(cid, "pool vm released");
                Ok(record)
            }
            None => {
                let instance = self
                    .launcher
                    .provider()
                    .get_instance(cid)
                    .await
                    .map_err(|e| into_cpi(e, &format!("virtual guest {}", cid)))?;
                tracing::warn!(cid, "vm not tracked by pool, registering it as free");
                let record = PoolRecord::from_instance(&instance, PoolState::Free);
                self.store.insert(&record).await?;
                Ok(record)
            }
        }
    }
}
