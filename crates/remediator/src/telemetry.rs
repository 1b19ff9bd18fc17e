//! Live telemetry access.
//!
//! Used twice per attempt: a short recent-history excerpt goes to the
//! diagnosis service, and the current value is re-read for verification.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;

/// Telemetry errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telemetry query failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("telemetry query returned status: {0}")]
    Query(String),

    #[error("no samples for {metric} on host {host_id}")]
    NoData { host_id: String, metric: String },

    #[error("unparseable sample value: {0}")]
    BadValue(String),
}

/// Source of live metric values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Latest value of `metric` on `host_id`.
    async fn current_value(&self, host_id: &str, metric: &str) -> Result<f64, TelemetryError>;

    /// Human-readable recent history, for diagnosis context.
    async fn recent_excerpt(&self, host_id: &str, metric: &str) -> Result<String, TelemetryError>;
}

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: Option<(f64, String)>,
    values: Option<Vec<(f64, String)>>,
}

/// Prometheus HTTP API client.
#[derive(Debug, Clone)]
pub struct PrometheusTelemetry {
    base_url: String,
    host_label: String,
    /// Lookback for the excerpt range query
    window: Duration,
    client: reqwest::Client,
}

impl PrometheusTelemetry {
    pub fn new(
        base_url: &str,
        host_label: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            host_label: host_label.to_string(),
            window: Duration::minutes(30),
            client,
        })
    }

    fn selector(&self, host_id: &str, metric: &str) -> String {
        format!(r#"{metric}{{{}="{host_id}"}}"#, self.host_label)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Vec<PrometheusResult>, TelemetryError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.get(&url).query(params).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Status { status, body });
        }

        let parsed: PrometheusResponse = response.json().await?;
        if parsed.status != "success" {
            return Err(TelemetryError::Query(parsed.status));
        }
        Ok(parsed.data.result)
    }
}

fn parse_value(raw: &str) -> Result<f64, TelemetryError> {
    raw.parse::<f64>()
        .map_err(|_| TelemetryError::BadValue(raw.to_string()))
}

fn sample_time(ts: f64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts as i64, 0).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl TelemetrySource for PrometheusTelemetry {
    async fn current_value(&self, host_id: &str, metric: &str) -> Result<f64, TelemetryError> {
        let query = self.selector(host_id, metric);
        debug!(query = %query, "Querying current value");

        let results = self.get("/api/v1/query", &[("query", query)]).await?;
        let (_, raw) = results
            .into_iter()
            .find_map(|r| r.value)
            .ok_or_else(|| TelemetryError::NoData {
                host_id: host_id.to_string(),
                metric: metric.to_string(),
            })?;
        parse_value(&raw)
    }

    async fn recent_excerpt(&self, host_id: &str, metric: &str) -> Result<String, TelemetryError> {
        let query = self.selector(host_id, metric);
        let end = Utc::now();
        let start = end - self.window;
        debug!(query = %query, start = %start, end = %end, "Querying recent history");

        let results = self
            .get(
                "/api/v1/query_range",
                &[
                    ("query", query),
                    ("start", start.timestamp().to_string()),
                    ("end", end.timestamp().to_string()),
                    ("step", "60".to_string()),
                ],
            )
            .await?;

        let samples: Vec<_> = results.into_iter().filter_map(|r| r.values).flatten().collect();
        if samples.is_empty() {
            return Err(TelemetryError::NoData {
                host_id: host_id.to_string(),
                metric: metric.to_string(),
            });
        }

        let mut excerpt = format!("{metric} on {host_id}, last {} minutes:\n", self.window.num_minutes());
        for (ts, raw) in samples {
            let _ = writeln!(excerpt, "{} {raw}", sample_time(ts).format("%H:%M:%S"));
        }
        Ok(excerpt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn telemetry(server: &MockServer) -> PrometheusTelemetry {
        PrometheusTelemetry::new(&server.uri(), "host", std::time::Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_current_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", r#"disk_percent{host="h1"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [{"metric": {"host": "h1"}, "value": [1_700_000_000.0, "80.5"]}]
                }
            })))
            .mount(&server)
            .await;

        let value = telemetry(&server).await.current_value("h1", "disk_percent").await.unwrap();
        assert!((value - 80.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_result_is_no_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"resultType": "vector", "result": []}
            })))
            .mount(&server)
            .await;

        let err = telemetry(&server).await.current_value("h1", "disk_percent").await.unwrap_err();
        assert!(matches!(err, TelemetryError::NoData { .. }));
    }

    #[tokio::test]
    async fn test_server_error_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = telemetry(&server).await.current_value("h1", "disk_percent").await.unwrap_err();
        assert!(matches!(err, TelemetryError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_recent_excerpt_lists_samples() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "matrix",
                    "result": [{
                        "metric": {"host": "h1"},
                        "values": [[1_700_000_000.0, "95"], [1_700_000_060.0, "97"]]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let excerpt = telemetry(&server).await.recent_excerpt("h1", "disk_percent").await.unwrap();
        assert!(excerpt.starts_with("disk_percent on h1"));
        assert!(excerpt.contains(" 95\n"));
        assert!(excerpt.contains(" 97\n"));
    }
}
