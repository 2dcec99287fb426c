use crate::AgentEnvStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use stratus_common::{AgentEnv, ComputeInstance, CpiError};

#[derive(Serialize, Deserialize)]
struct SettingsBody {
    settings: String,
}

/// Configuration documents kept in the HTTP registry, one per instance id.
pub struct RegistryAgentEnvStore {
    client: Client,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
}

impl RegistryAgentEnvStore {
    pub fn new(base_url: &str, user: Option<String>, password: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building registry HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
            password,
        })
    }

    fn settings_url(&self, instance_id: i64) -> String {
        format!("{}/instances/{}/settings", self.base_url, instance_id)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.user {
            Some(user) => req.basic_auth(user, self.password.as_ref()),
            None => req,
        }
    }
}

#[async_trait]
impl AgentEnvStore for RegistryAgentEnvStore {
    async fn fetch(&self, instance: &ComputeInstance) -> Result<AgentEnv> {
        let url = self.settings_url(instance.id);
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CpiError::NotFound(format!("agent settings for vm {}", instance.id)).into());
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("GET {}", url))?;
        let body: SettingsBody = resp.json().await.context("decoding registry response")?;
        serde_json::from_str(&body.settings)
            .with_context(|| format!("parsing agent settings of vm {}", instance.id))
    }

    async fn update(&self, instance: &ComputeInstance, env: &AgentEnv) -> Result<()> {
        let url = self.settings_url(instance.id);
        let body = SettingsBody {
            settings: serde_json::to_string(env)?,
        };
        self.authed(self.client.put(&url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("PUT {}", url))?
            .error_for_status()
            .with_context(|| format!("PUT {}", url))?;
        tracing::debug!(cid = instance.id, "agent settings updated");
        Ok(())
    }
}
