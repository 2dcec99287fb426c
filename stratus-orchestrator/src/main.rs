use anyhow::Context;
use std::sync::Arc;
use stratus_orchestrator::api::{self, AppState};
use stratus_orchestrator::pool::PoolStore;
use stratus_orchestrator::registry::provider_for;
use stratus_orchestrator::settings::Settings;
use stratus_providers::registry::RegistryAgentEnvStore;
use stratus_providers::ssh::SshRemote;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Arc::new(Settings::from_env()?);
    tracing::info!(
        provider = %settings.provider,
        creator = ?settings.creator,
        pool_db = %settings.pool_database_url,
        "stratus orchestrator starting"
    );

    let provider = provider_for(&settings)?;
    let remote = Arc::new(SshRemote::new(settings.ssh_timeout));
    let agent_env_store = Arc::new(RegistryAgentEnvStore::new(
        &settings.registry_url,
        settings.registry_user.clone(),
        settings.registry_password.clone(),
    )?);
    let pool = PoolStore::connect(
        &settings.pool_database_url,
        settings.pool_max_connections,
        settings.timeouts.store_contention,
    )
    .await?;

    let state = Arc::new(AppState::build(
        settings.clone(),
        provider,
        remote,
        agent_env_store,
        pool,
    ));
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.listen_addr))?;
    tracing::info!(addr = %settings.listen_addr, "orchestrator listening");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
