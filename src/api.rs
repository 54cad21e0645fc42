use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::data::HealthSnapshot;
use crate::time::now_ms;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SYNCED_STATE: &str = "synced";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{endpoint} returned {status} - {message}")]
    RequestFailed {
        endpoint: String,
        status: StatusCode,
        message: String,
    },
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Result of one delivery attempt; `message` is `"<code> <reason>"` when
/// the hub answered, or the transport error otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub success: bool,
    pub message: String,
}

impl PublishOutcome {
    fn from_result(result: Result<StatusCode, ApiError>) -> Self {
        match result {
            Ok(status) => Self {
                success: true,
                message: status.to_string(),
            },
            Err(ApiError::RequestFailed { status, .. }) => Self {
                success: false,
                message: status.to_string(),
            },
            Err(ApiError::Transport { source, .. }) | Err(ApiError::Client(source)) => Self {
                success: false,
                message: source.to_string(),
            },
        }
    }
}

/// Delivers a snapshot to a remote sensor.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        snapshot: &HealthSnapshot,
        sensor_id: &str,
        base_url: &str,
        token: &str,
    ) -> PublishOutcome;
}

pub struct HomeAssistantClient {
    client: reqwest::Client,
}

impl HomeAssistantClient {
    pub fn new() -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self { client })
    }

    /// `GET <base>/api/`, the hub's own liveness endpoint.
    pub async fn check(&self, base_url: &str, token: &str) -> PublishOutcome {
        let endpoint = "/api/";
        let request = self.client.get(url(base_url, endpoint)).bearer_auth(token);
        PublishOutcome::from_result(self.send(request, endpoint).await)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<StatusCode, ApiError> {
        let response = request.send().await.map_err(|source| ApiError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;
        check_response(response, endpoint).await
    }
}

#[async_trait]
impl Publisher for HomeAssistantClient {
    async fn publish(
        &self,
        snapshot: &HealthSnapshot,
        sensor_id: &str,
        base_url: &str,
        token: &str,
    ) -> PublishOutcome {
        let endpoint = format!("/api/states/sensor.{}", sensor_id);
        let body = json!({
            "state": SYNCED_STATE,
            "last_updated": now_ms(),
            "attributes": snapshot,
        });

        let request = self
            .client
            .post(url(base_url, &endpoint))
            .bearer_auth(token)
            .json(&body);

        let outcome = PublishOutcome::from_result(self.send(request, &endpoint).await);
        if outcome.success {
            debug!(%endpoint, status = %outcome.message, "published snapshot");
        } else {
            warn!(%endpoint, status = %outcome.message, "publish rejected");
        }
        outcome
    }
}

fn url(base_url: &str, endpoint: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), endpoint)
}

async fn check_response(response: reqwest::Response, endpoint: &str) -> Result<StatusCode, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(status);
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        "Empty response".to_string()
    } else {
        body.chars().take(500).collect::<String>()
    };
    Err(ApiError::RequestFailed {
        endpoint: endpoint.to_string(),
        status,
        message,
    })
}
