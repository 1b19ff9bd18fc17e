//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for Slack webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Upper bound on a single webhook request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build Slack HTTP client, using defaults");
            reqwest::Client::new()
        })
}

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a new Slack channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_SLACK_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Slack notifications enabled");
        } else {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: http_client(REQUEST_TIMEOUT),
        }
    }

    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self::with_timeout(webhook_url, REQUEST_TIMEOUT)
    }

    /// Create a Slack channel whose requests give up after `timeout`.
    #[must_use]
    pub fn with_timeout(webhook_url: String, timeout: Duration) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: http_client(timeout),
        }
    }

    /// Format an event as a Slack webhook payload.
    fn format_payload(event: &NotifyEvent) -> SlackPayload {
        let fields = Self::format_fields(event)
            .into_iter()
            .map(|(title, value)| SlackField {
                title,
                value,
                short: true,
            })
            .collect();

        let attachment = SlackAttachment {
            fallback: event.title(),
            color: event.severity().color().to_string(),
            author_name: Some("Remediator".to_string()),
            title: event.title(),
            text: Self::format_description(event),
            fields,
            footer: Some(format!(
                "{} | {}",
                event.severity().as_str(),
                event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(event.timestamp().timestamp()),
        };

        SlackPayload {
            attachments: vec![attachment],
        }
    }

    /// Format the description for an event.
    fn format_description(event: &NotifyEvent) -> String {
        match event {
            NotifyEvent::RemediationFinished {
                status,
                reason,
                duration_secs,
                ..
            } => {
                let icon = match status.as_str() {
                    "success" => "✅",
                    "blocked" => "⛔",
                    _ => "❌",
                };
                let duration = format_duration(*duration_secs);
                match reason {
                    Some(reason) => format!("{icon} *{status}* after {duration}\n*Reason:* `{reason}`"),
                    None => format!("{icon} *{status}* after {duration}"),
                }
            }

            NotifyEvent::ApprovalRequested {
                runbook,
                timeout_secs,
                ..
            } => format!(
                "Runbook `{runbook}` requires approval. It is denied automatically in {}.",
                format_duration(*timeout_secs)
            ),

            NotifyEvent::PersistenceEscalation { error, record, .. } => {
                format!("Outcome could not be written to the record store: {error}\n```{record}```")
            }
        }
    }

    /// Format additional fields for an event.
    fn format_fields(event: &NotifyEvent) -> Vec<(String, String)> {
        match event {
            NotifyEvent::RemediationFinished {
                record_id,
                alert_id,
                host_id,
                runbook,
                ..
            } => vec![
                ("Record".to_string(), record_id.clone()),
                ("Alert".to_string(), alert_id.clone()),
                ("Host".to_string(), host_id.clone()),
                (
                    "Runbook".to_string(),
                    runbook.clone().unwrap_or_else(|| "-".to_string()),
                ),
            ],

            NotifyEvent::ApprovalRequested {
                record_id,
                alert_id,
                host_id,
                ..
            } => vec![
                ("Record".to_string(), record_id.clone()),
                ("Alert".to_string(), alert_id.clone()),
                ("Host".to_string(), host_id.clone()),
            ],

            NotifyEvent::PersistenceEscalation {
                record_id,
                host_id,
                status,
                ..
            } => vec![
                ("Record".to_string(), record_id.clone()),
                ("Host".to_string(), host_id.clone()),
                ("Status".to_string(), status.clone()),
            ],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_SLACK_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(event);

        debug!(channel = "slack", event_type = ?event.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "slack", "Notification sent successfully");
            return Ok(());
        }

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            channel = "slack",
            status = %status,
            body = %body,
            "Slack webhook request failed"
        );

        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

/// Format seconds into a human-readable duration.
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let remaining_secs = secs % 60;
        if remaining_secs == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {remaining_secs}s")
        }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {mins}m")
        }
    }
}
