//! Read-only access to alert and host records owned by the monitoring system.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::types::{Alert, Host};

/// Alert source errors.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("monitor API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("monitor API returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Fetch-by-id for alerts and hosts. `None` means the record does not exist.
#[async_trait]
pub trait AlertSource: Send + Sync {
    async fn fetch_alert(&self, alert_id: &str) -> Result<Option<Alert>, SourceError>;

    async fn fetch_host(&self, host_id: &str) -> Result<Option<Host>, SourceError>;
}

/// Monitor REST API client.
#[derive(Debug, Clone)]
pub struct HttpAlertSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAlertSource {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, SourceError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "Fetching from monitor API");

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status { status, body });
        }
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl AlertSource for HttpAlertSource {
    async fn fetch_alert(&self, alert_id: &str) -> Result<Option<Alert>, SourceError> {
        self.get(&format!("/api/alerts/{alert_id}")).await
    }

    async fn fetch_host(&self, host_id: &str) -> Result<Option<Host>, SourceError> {
        self.get(&format!("/api/hosts/{host_id}")).await
    }
}
