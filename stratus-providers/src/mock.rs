//! In-memory stand-ins for the provider, the remote channel and the
//! configuration store. Used by tests and by `STRATUS_PROVIDER=mock`.

use crate::{AgentEnvStore, ApiError, ComputeProvider, RemoteCommand};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use stratus_common::{
    AgentEnv, AllowedHost, ComputeInstance, CpiError, Credential, InstanceTemplate, PowerState,
    Transaction, Volume,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateInstance,
    GetInstance(i64),
    FindByBackendIp(String),
    FindByPrimaryIp(String),
    DeleteInstance(i64),
    ReloadInstance { id: i64, stemcell_id: i64 },
    PowerState(i64),
    ActiveTransactions(i64),
    LastTransaction(i64),
    AttachEphemeralDisk { id: i64, size_gb: i64 },
    SetTags(i64),
    OrderVolume,
    FindVolumeByOrder(i64),
    GetVolume(i64),
    CancelVolume(i64),
    AuthorizeHost { instance_id: i64, volume_id: i64 },
    DeauthorizeHost { instance_id: i64, volume_id: i64 },
    AllowedHost(i64),
}

struct MockInstance {
    instance: ComputeInstance,
    power: PowerState,
    busy_polls: u32,
    last_transaction: Option<Transaction>,
    tags: Vec<String>,
}

struct MockState {
    next_id: i64,
    next_volume_id: i64,
    instances: BTreeMap<i64, MockInstance>,
    volumes: BTreeMap<i64, Volume>,
    orders: BTreeMap<i64, (i64, u32)>,
    calls: Vec<MockCall>,
    reload_busy_polls: u32,
    volume_visible_after: u32,
    ephemeral_error: Option<ApiError>,
    authorize_busy: u32,
    authorize_errors: VecDeque<ApiError>,
}

pub struct MockProvider {
    state: Mutex<MockState>,
}

fn not_found(what: &str) -> anyhow::Error {
    ApiError::new(404, "SoftLayer_Exception_ObjectNotFound", format!("Unable to find {}", what)).into()
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_first_id(1000)
    }

    pub fn with_first_id(first_id: i64) -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: first_id,
                next_volume_id: 9000,
                instances: BTreeMap::new(),
                volumes: BTreeMap::new(),
                orders: BTreeMap::new(),
                calls: Vec::new(),
                reload_busy_polls: 1,
                volume_visible_after: 0,
                ephemeral_error: None,
                authorize_busy: 0,
                authorize_errors: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the rest of the suite.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }

    pub fn instance_for(id: i64, template: &InstanceTemplate) -> ComputeInstance {
        let fqdn = if template.hostname.is_empty() {
            format!("vm-{}.mock.local", id)
        } else {
            format!("{}.{}", template.hostname, template.domain)
        };
        ComputeInstance {
            id,
            datacenter_id: 1,
            primary_ip: Some(format!("169.50.{}.{}", (id / 250) % 250, id % 250)),
            primary_backend_ip: format!("10.0.{}.{}", (id / 250) % 250, id % 250),
            fqdn,
            cpu: template.start_cpus,
            memory_mb: template.max_memory_mb,
            private_vlan_id: template.private_vlan_id,
            public_vlan_id: template.public_vlan_id,
            root: Credential {
                username: "root".to_string(),
                password: format!("pw-{}", id),
            },
        }
    }

    pub fn seed_instance(&self, instance: ComputeInstance) {
        let mut st = self.lock();
        st.instances.insert(
            instance.id,
            MockInstance {
                instance,
                power: PowerState::Running,
                busy_polls: 0,
                last_transaction: None,
                tags: Vec::new(),
            },
        );
    }

    pub fn seed_volume(&self, volume: Volume) {
        self.lock().volumes.insert(volume.id, volume);
    }

    /// Number of `active_transactions` polls that observe the reload as running.
    pub fn set_reload_busy_polls(&self, polls: u32) {
        self.lock().reload_busy_polls = polls;
    }

    pub fn set_volume_visible_after(&self, polls: u32) {
        self.lock().volume_visible_after = polls;
    }

    pub fn fail_ephemeral_with(&self, err: ApiError) {
        self.lock().ephemeral_error = Some(err);
    }

    /// The next `polls` authorize/deauthorize calls report "volume busy".
    pub fn set_authorize_busy(&self, polls: u32) {
        self.lock().authorize_busy = polls;
    }

    pub fn push_authorize_error(&self, err: ApiError) {
        self.lock().authorize_errors.push_back(err);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn create_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::CreateInstance))
    }

    pub fn reload_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::ReloadInstance { .. }))
    }

    pub fn has_instance(&self, id: i64) -> bool {
        self.lock().instances.contains_key(&id)
    }

    pub fn tags(&self, id: i64) -> Vec<String> {
        self.lock()
            .instances
            .get(&id)
            .map(|i| i.tags.clone())
            .unwrap_or_default()
    }

    pub fn volume(&self, id: i64) -> Option<Volume> {
        self.lock().volumes.get(&id).cloned()
    }

    fn instance_by<F>(&self, pred: F, what: &str) -> Result<ComputeInstance>
    where
        F: Fn(&ComputeInstance) -> bool,
    {
        self.lock()
            .instances
            .values()
            .map(|i| &i.instance)
            .find(|i| pred(i))
            .cloned()
            .ok_or_else(|| not_found(what))
    }
}

#[async_trait]
impl ComputeProvider for MockProvider {
    async fn create_instance(&self, template: &InstanceTemplate) -> Result<i64> {
        let mut st = self.lock();
        st.calls.push(MockCall::CreateInstance);
        let id = st.next_id;
        st.next_id += 1;
        st.instances.insert(
            id,
            MockInstance {
                instance: Self::instance_for(id, template),
                power: PowerState::Running,
                busy_polls: 0,
                last_transaction: Some(Transaction {
                    id: id * 10,
                    group: "Service Setup".to_string(),
                    status: "Complete".to_string(),
                }),
                tags: Vec::new(),
            },
        );
        tracing::debug!(cid = id, "mock instance created");
        Ok(id)
    }

    async fn get_instance(&self, id: i64) -> Result<ComputeInstance> {
        self.record(MockCall::GetInstance(id));
        self.instance_by(|i| i.id == id, &format!("virtual guest {}", id))
    }

    async fn find_instance_by_backend_ip(&self, ip: &str) -> Result<ComputeInstance> {
        self.record(MockCall::FindByBackendIp(ip.to_string()));
        self.instance_by(|i| i.primary_backend_ip == ip, &format!("virtual guest with backend ip {}", ip))
    }

    async fn find_instance_by_primary_ip(&self, ip: &str) -> Result<ComputeInstance> {
        self.record(MockCall::FindByPrimaryIp(ip.to_string()));
        self.instance_by(
            |i| i.primary_ip.as_deref() == Some(ip),
            &format!("virtual guest with primary ip {}", ip),
        )
    }

    async fn delete_instance(&self, id: i64) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(MockCall::DeleteInstance(id));
        st.instances
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(&format!("virtual guest {}", id)))
    }

    async fn reload_instance(&self, id: i64, stemcell_id: i64) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(MockCall::ReloadInstance { id, stemcell_id });
        let busy = st.reload_busy_polls;
        let inst = st
            .instances
            .get_mut(&id)
            .ok_or_else(|| not_found(&format!("virtual guest {}", id)))?;
        inst.busy_polls = busy;
        inst.last_transaction = Some(Transaction {
            id: id * 10 + 1,
            group: "OS Reload".to_string(),
            status: "Complete".to_string(),
        });
        Ok(())
    }

    async fn power_state(&self, id: i64) -> Result<PowerState> {
        let mut st = self.lock();
        st.calls.push(MockCall::PowerState(id));
        st.instances
            .get(&id)
            .map(|i| i.power.clone())
            .ok_or_else(|| not_found(&format!("virtual guest {}", id)))
    }

    async fn active_transactions(&self, id: i64) -> Result<Vec<Transaction>> {
        let mut st = self.lock();
        st.calls.push(MockCall::ActiveTransactions(id));
        let inst = st
            .instances
            .get_mut(&id)
            .ok_or_else(|| not_found(&format!("virtual guest {}", id)))?;
        if inst.busy_polls == 0 {
            return Ok(vec![]);
        }
        inst.busy_polls -= 1;
        Ok(vec![Transaction {
            id: id * 10 + 1,
            group: "OS Reload".to_string(),
            status: "Processing".to_string(),
        }])
    }

    async fn last_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let mut st = self.lock();
        st.calls.push(MockCall::LastTransaction(id));
        st.instances
            .get(&id)
            .map(|i| i.last_transaction.clone())
            .ok_or_else(|| not_found(&format!("virtual guest {}", id)))
    }

    async fn attach_ephemeral_disk(&self, id: i64, size_gb: i64) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(MockCall::AttachEphemeralDisk { id, size_gb });
        match st.ephemeral_error.clone() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn set_tags(&self, id: i64, tags: &[String]) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(MockCall::SetTags(id));
        let inst = st
            .instances
            .get_mut(&id)
            .ok_or_else(|| not_found(&format!("virtual guest {}", id)))?;
        inst.tags = tags.to_vec();
        Ok(())
    }

    async fn order_volume(&self, _datacenter: &str, size_gb: i64, iops: Option<i64>) -> Result<i64> {
        let mut st = self.lock();
        st.calls.push(MockCall::OrderVolume);
        let volume_id = st.next_volume_id;
        st.next_volume_id += 1;
        let order_id = volume_id + 100_000;
        st.volumes.insert(
            volume_id,
            Volume {
                id: volume_id,
                capacity_gb: size_gb,
                iops,
                backend_ip: "10.2.0.10".to_string(),
                credential: Credential {
                    username: format!("SL01SEL{}", volume_id),
                    password: "volume-secret".to_string(),
                },
                allowed_hosts: vec![],
            },
        );
        let visible_after = st.volume_visible_after;
        st.orders.insert(order_id, (volume_id, visible_after));
        Ok(order_id)
    }

    async fn find_volume_by_order(&self, order_id: i64) -> Result<Option<Volume>> {
        let mut st = self.lock();
        st.calls.push(MockCall::FindVolumeByOrder(order_id));
        let Some((volume_id, remaining)) = st.orders.get_mut(&order_id) else {
            return Err(not_found(&format!("order {}", order_id)));
        };
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(None);
        }
        let volume_id = *volume_id;
        Ok(st.volumes.get(&volume_id).cloned())
    }

    async fn get_volume(&self, id: i64) -> Result<Volume> {
        let mut st = self.lock();
        st.calls.push(MockCall::GetVolume(id));
        st.volumes
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(&format!("network storage {}", id)))
    }

    async fn cancel_volume(&self, id: i64) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(MockCall::CancelVolume(id));
        st.volumes
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(&format!("network storage {}", id)))
    }

    async fn authorize_host(&self, instance_id: i64, volume_id: i64) -> Result<bool> {
        let mut st = self.lock();
        st.calls.push(MockCall::AuthorizeHost { instance_id, volume_id });
        if let Some(err) = st.authorize_errors.pop_front() {
            return Err(err.into());
        }
        if st.authorize_busy > 0 {
            st.authorize_busy -= 1;
            return Ok(false);
        }
        let volume = st
            .volumes
            .get_mut(&volume_id)
            .ok_or_else(|| not_found(&format!("network storage {}", volume_id)))?;
        if !volume.allowed_hosts.contains(&instance_id) {
            volume.allowed_hosts.push(instance_id);
        }
        Ok(true)
    }

    async fn deauthorize_host(&self, instance_id: i64, volume_id: i64) -> Result<bool> {
        let mut st = self.lock();
        st.calls.push(MockCall::DeauthorizeHost { instance_id, volume_id });
        if let Some(err) = st.authorize_errors.pop_front() {
            return Err(err.into());
        }
        if st.authorize_busy > 0 {
            st.authorize_busy -= 1;
            return Ok(false);
        }
        let volume = st
            .volumes
            .get_mut(&volume_id)
            .ok_or_else(|| not_found(&format!("network storage {}", volume_id)))?;
        volume.allowed_hosts.retain(|h| *h != instance_id);
        Ok(true)
    }

    async fn allowed_host(&self, instance_id: i64) -> Result<AllowedHost> {
        self.record(MockCall::AllowedHost(instance_id));
        Ok(AllowedHost {
            name: Some(format!("iqn.2005-05.com.softlayer:sl01su{}-v{}", instance_id, instance_id)),
            credential: Credential {
                username: format!("SL01SU{}-V{}", instance_id, instance_id),
                password: "chap-secret".to_string(),
            },
        })
    }
}

// --- Remote command channel ---

struct Rule {
    needle: String,
    outputs: VecDeque<std::result::Result<String, String>>,
}

/// Scripted remote channel: the first rule whose needle occurs in the command
/// answers it. A rule replays its outputs in order and repeats the last one.
#[derive(Default)]
pub struct MockRemote {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, String)>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, needle: &str, output: &str) -> &Self {
        self.on_sequence(needle, &[output])
    }

    pub fn on_sequence(&self, needle: &str, outputs: &[&str]) -> &Self {
        self.push_rule(needle, outputs.iter().map(|o| Ok(o.to_string())).collect())
    }

    pub fn fail_on(&self, needle: &str, message: &str) -> &Self {
        self.push_rule(needle, VecDeque::from(vec![Err(message.to_string())]))
    }

    fn push_rule(&self, needle: &str, outputs: VecDeque<std::result::Result<String, String>>) -> &Self {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Rule {
                needle: needle.to_string(),
                outputs,
            });
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// (remote path, uploaded file contents)
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    /// Index of the first command containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }
}

#[async_trait]
impl RemoteCommand for MockRemote {
    async fn exec(&self, _user: &str, _password: &str, _host: &str, command: &str) -> Result<String> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.to_string());

        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let Some(rule) = rules.iter_mut().find(|r| command.contains(&r.needle)) else {
            return Ok(String::new());
        };
        let out = if rule.outputs.len() > 1 {
            rule.outputs.pop_front()
        } else {
            rule.outputs.front().cloned()
        };
        match out {
            Some(Ok(s)) => Ok(s),
            Some(Err(message)) => Err(CpiError::RemoteExecution {
                command: command.to_string(),
                message,
            }
            .into()),
            None => Ok(String::new()),
        }
    }

    async fn upload(
        &self,
        _user: &str,
        _password: &str,
        _host: &str,
        local_file: &Path,
        remote_path: &str,
    ) -> Result<()> {
        let contents = std::fs::read_to_string(local_file)?;
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((remote_path.to_string(), contents));
        Ok(())
    }
}

// --- Configuration document store ---

#[derive(Default)]
pub struct MockAgentEnvStore {
    docs: Mutex<HashMap<i64, AgentEnv>>,
}

impl MockAgentEnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, instance_id: i64, env: AgentEnv) {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id, env);
    }

    pub fn get(&self, instance_id: i64) -> Option<AgentEnv> {
        self.docs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&instance_id)
            .cloned()
    }
}

#[async_trait]
impl AgentEnvStore for MockAgentEnvStore {
    async fn fetch(&self, instance: &ComputeInstance) -> Result<AgentEnv> {
        self.get(instance.id)
            .ok_or_else(|| CpiError::NotFound(format!("agent settings for vm {}", instance.id)).into())
    }

    async fn update(&self, instance: &ComputeInstance, env: &AgentEnv) -> Result<()> {
        self.put(instance.id, env.clone());
        Ok(())
    }
}
