//! AI diagnosis client.
//!
//! Diagnosis is advisory: any error here degrades to rule-based matching
//! and never blocks or admits a remediation on its own.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::types::{Alert, Diagnosis};

/// Diagnosis errors.
#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error("diagnosis service unavailable: {0}")]
    Unavailable(String),

    #[error("diagnosis timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid diagnosis response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for DiagnosisError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}

/// What the reasoning service is shown.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisRequest<'a> {
    pub alert: &'a Alert,
    /// Recent metric history; empty when telemetry was unavailable
    pub excerpt: &'a str,
    /// Runbook ids the service may recommend
    pub runbooks: Vec<&'a str>,
}

/// Reasoning service seam.
#[async_trait]
pub trait DiagnosisClient: Send + Sync {
    async fn diagnose(&self, request: &DiagnosisRequest<'_>) -> Result<Diagnosis, DiagnosisError>;
}

/// JSON-over-HTTP reasoning service.
#[derive(Debug, Clone)]
pub struct HttpDiagnosisClient {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpDiagnosisClient {
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, DiagnosisError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl DiagnosisClient for HttpDiagnosisClient {
    async fn diagnose(&self, request: &DiagnosisRequest<'_>) -> Result<Diagnosis, DiagnosisError> {
        debug!(alert_id = %request.alert.id, url = %self.url, "Requesting diagnosis");

        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DiagnosisError::Unavailable(format!("status {status}: {body}")));
        }

        let diagnosis: Diagnosis = response.json().await?;
        if !(0.0..=1.0).contains(&diagnosis.confidence) {
            return Err(DiagnosisError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                diagnosis.confidence
            )));
        }
        Ok(diagnosis)
    }
}
