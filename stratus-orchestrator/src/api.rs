use crate::disks::DiskManager;
use crate::pool::{PoolAllocator, PoolStore};
use crate::provisioner::launch::InstanceLauncher;
use crate::provisioner::{set_vm_metadata, Provisioner};
use crate::registry::Registry;
use crate::settings::Settings;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use stratus_common::{error_kind, ErrorKind, PoolState, ProvisioningRequest};
use stratus_providers::{AgentEnvStore, ComputeProvider, RemoteCommand};

pub struct AppState {
    pub registry: Registry,
    pub disks: DiskManager,
    pub provider: Arc<dyn ComputeProvider>,
    pub pool: PoolStore,
}

impl AppState {
    /// Wires the orchestrator around the given collaborators.
    pub fn build(
        settings: Arc<Settings>,
        provider: Arc<dyn ComputeProvider>,
        remote: Arc<dyn RemoteCommand>,
        agent_env_store: Arc<dyn AgentEnvStore>,
        pool: PoolStore,
    ) -> Self {
        let launcher = Arc::new(InstanceLauncher::new(provider.clone(), settings.timeouts));
        let allocator = Arc::new(PoolAllocator::new(
            pool.clone(),
            Arc::new(pool.clone()),
            launcher.clone(),
        ));
        let provisioner = Provisioner::new(
            launcher.clone(),
            remote.clone(),
            agent_env_store.clone(),
            settings.clone(),
        );
        let registry = Registry::build(settings.creator, provisioner, launcher, allocator);
        let disks = DiskManager::new(provider.clone(), remote, agent_env_store, settings);
        Self {
            registry,
            disks,
            provider,
            pool,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/vms", post(create_vm))
        .route("/vms/:cid", delete(delete_vm))
        .route("/vms/:cid/metadata", post(set_metadata))
        .route("/vms/:cid/disks/:disk_id", post(attach_disk).delete(detach_disk))
        .route("/disks", post(create_disk))
        .route("/disks/:disk_id", delete(delete_disk))
        .route("/pool", get(list_pool))
        .with_state(state)
}

pub struct ApiFailure(anyhow::Error);

impl From<anyhow::Error> for ApiFailure {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

pub fn status_for(kind: Option<ErrorKind>) -> StatusCode {
    match kind {
        Some(ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::InvalidNetworks) | Some(ErrorKind::Configuration) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::ProviderRejected) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let kind = error_kind(&self.0);
        let status = status_for(kind);
        let label = kind.map(|k| format!("{:?}", k)).unwrap_or_else(|| "Unknown".to_string());
        (
            status,
            Json(json!({"error": label, "message": format!("{:#}", self.0)})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiFailure>;

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"status": "ok", "creator": format!("{:?}", state.registry.kind())}))
}

async fn create_vm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProvisioningRequest>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.registry.creator().create(&request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "cid": instance.id,
            "hostname": instance.fqdn,
            "backend_ip": instance.primary_backend_ip,
            "primary_ip": instance.primary_ip,
        })),
    ))
}

async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<i64>,
) -> ApiResult<StatusCode> {
    state.registry.deleter().delete(cid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Metadata map rendered as `key:value` tags, sorted by key.
pub fn metadata_tags(metadata: &BTreeMap<String, String>) -> Vec<String> {
    metadata
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect()
}

async fn set_metadata(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<i64>,
    Json(metadata): Json<BTreeMap<String, String>>,
) -> ApiResult<StatusCode> {
    set_vm_metadata(state.provider.as_ref(), cid, &metadata_tags(&metadata)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn attach_disk(
    State(state): State<Arc<AppState>>,
    Path((cid, disk_id)): Path<(i64, i64)>,
) -> ApiResult<impl IntoResponse> {
    let device_path = state.disks.attach_disk(cid, disk_id).await?;
    Ok(Json(json!({"device_path": device_path})))
}

async fn detach_disk(
    State(state): State<Arc<AppState>>,
    Path((cid, disk_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state.disks.detach_disk(cid, disk_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Debug)]
struct CreateDiskRequest {
    size_mb: i64,
    datacenter: String,
    iops: Option<i64>,
}

async fn create_disk(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDiskRequest>,
) -> ApiResult<impl IntoResponse> {
    let volume = state
        .disks
        .create_disk(req.size_mb, &req.datacenter, req.iops)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"disk_id": volume.id, "capacity_gb": volume.capacity_gb})),
    ))
}

async fn delete_disk(
    State(state): State<Arc<AppState>>,
    Path(disk_id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.disks.delete_disk(disk_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Debug, Default)]
struct PoolQuery {
    state: Option<PoolState>,
}

async fn list_pool(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PoolQuery>,
) -> ApiResult<impl IntoResponse> {
    let records = state.pool.list(q.state).await?;
    Ok(Json(records))
}
