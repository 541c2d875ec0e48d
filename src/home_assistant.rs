use crate::value_resolver::HelperState;
use reqwest::StatusCode;
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tokio::time::timeout;

pub const DEFAULT_HA_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal client for the Home Assistant REST states endpoint
#[derive(Debug, Clone)]
pub struct HomeAssistantAPI {
    endpoint_url: String,
    auth_token: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HomeAssistantAPI {
    pub fn new(endpoint_url: &str, auth_token: &str) -> Self {
        Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            timeout: DEFAULT_HA_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    /// Bound for one state read, response body included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds a client from `HA_URL` / `HA_TOKEN`; `None` when no URL is set
    pub fn from_env() -> Option<Self> {
        let url = env::var("HA_URL").unwrap_or_default();
        if url.trim().is_empty() {
            return None;
        }
        let token = env::var("HA_TOKEN").unwrap_or_default();
        Some(Self::new(url.trim(), &token))
    }

    /// Reads one helper entity. A missing entity is a state, not an error.
    pub async fn read_helper_state(&self, entity_id: &str) -> Result<HelperState, anyhow::Error> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No HA connection");
        }
        match timeout(self.timeout, self.read_sensor(entity_id)).await {
            Ok(result) => Ok(result?
                .map(|sensor| HelperState::from_raw(&sensor.state))
                .unwrap_or(HelperState::NotFound)),
            Err(_) => anyhow::bail!("Timed out after {:?} reading {}", self.timeout, entity_id),
        }
    }

    async fn read_sensor(&self, entity_id: &str) -> Result<Option<HASensor>, anyhow::Error> {
        let response = self
            .client
            .get(format!("{}/api/states/{}", self.endpoint_url, entity_id))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => anyhow::bail!("HTTP {} reading {}", status, entity_id),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HASensor {
    pub entity_id: String,
    pub state: String,
}
