//! Notification event types for remediation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the attachment color for this severity.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",     // Blue
            Self::Warning => "#f39c12",  // Orange
            Self::Critical => "#e74c3c", // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A remediation record reached a terminal state (success, failed, blocked)
    RemediationFinished {
        record_id: String,
        alert_id: String,
        host_id: String,
        status: String,
        #[serde(default)]
        runbook: Option<String>,
        #[serde(default)]
        reason: Option<String>,
        duration_secs: u64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A CONFIRM-level runbook is waiting for a human to approve it
    ApprovalRequested {
        record_id: String,
        alert_id: String,
        host_id: String,
        runbook: String,
        timeout_secs: u64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A terminal outcome could not be persisted; the record travels here instead
    PersistenceEscalation {
        record_id: String,
        host_id: String,
        status: String,
        error: String,
        /// Full record snapshot, JSON encoded
        record: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::RemediationFinished {
                host_id,
                status,
                runbook,
                ..
            } => {
                let runbook = runbook.as_deref().unwrap_or("no runbook");
                format!("Remediation {status}: {runbook} on {host_id}")
            }
            Self::ApprovalRequested {
                host_id, runbook, ..
            } => format!("Approval Needed: {runbook} on {host_id}"),
            Self::PersistenceEscalation { record_id, .. } => {
                format!("Unpersisted Remediation Outcome: {record_id}")
            }
        }
    }

    /// Get the severity/color for this event.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::RemediationFinished { status, .. } => match status.as_str() {
                "success" => Severity::Info,
                "blocked" => Severity::Warning,
                _ => Severity::Critical,
            },
            Self::ApprovalRequested { .. } => Severity::Warning,
            Self::PersistenceEscalation { .. } => Severity::Critical,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RemediationFinished { timestamp, .. }
            | Self::ApprovalRequested { timestamp, .. }
            | Self::PersistenceEscalation { timestamp, .. } => *timestamp,
        }
    }
}
