//! Core types for alert remediation.
//!
//! This module defines the data carried through a remediation attempt:
//! - Alerts and hosts as read from the monitoring system
//! - Requests, diagnoses and command results
//! - The durable `RemediationRecord` and its forward-only status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::TransitionError;

/// How much human involvement a runbook needs before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// May execute without human sign-off
    Auto,
    /// Requires explicit approval
    Confirm,
    /// Must never execute
    Block,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Confirm => "CONFIRM",
            Self::Block => "BLOCK",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a remediation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemediationStatus {
    Pending,
    Diagnosing,
    Matched,
    Blocked,
    Executing,
    Verifying,
    Success,
    Failed,
}

impl RemediationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Diagnosing => "diagnosing",
            Self::Matched => "matched",
            Self::Blocked => "blocked",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Blocked, success and failed records never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Blocked | Self::Success | Self::Failed)
    }

    /// Whether `next` is a legal forward step from this status.
    ///
    /// Verification is optional: a sequence that finished after its alert
    /// was withdrawn goes straight from executing to its outcome.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use RemediationStatus::{
            Blocked, Diagnosing, Executing, Failed, Matched, Pending, Success, Verifying,
        };
        matches!(
            (self, next),
            (Pending, Diagnosing | Blocked)
                | (Diagnosing, Matched | Blocked)
                | (Matched, Blocked | Executing)
                | (Executing, Verifying | Success | Failed)
                | (Verifying, Success | Failed)
        )
    }
}

impl fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record was blocked before any command ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    NoMatchingRunbook,
    CircuitOpen,
    RiskBlocked,
    BlacklistViolation,
    CommandNotAllowed,
    RateLimited,
    ApprovalTimeout,
    AlertResolvedBeforeAction,
    InvalidCommandTemplate,
    TargetUnavailable,
    SafetyStateUnavailable,
}

impl BlockReason {
    /// Machine-readable reason, as stored and reported.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoMatchingRunbook => "no_matching_runbook",
            Self::CircuitOpen => "circuit_open",
            Self::RiskBlocked => "risk_blocked",
            Self::BlacklistViolation => "blacklist_violation",
            Self::CommandNotAllowed => "command_not_allowed",
            Self::RateLimited => "rate_limited",
            Self::ApprovalTimeout => "approval_timeout",
            Self::AlertResolvedBeforeAction => "alert_resolved_before_action",
            Self::InvalidCommandTemplate => "invalid_command_template",
            Self::TargetUnavailable => "target_unavailable",
            Self::SafetyStateUnavailable => "safety_state_unavailable",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt that reached the executor ended as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CommandFailed,
    CommandTimeout,
    TransportError,
    VerificationFailed,
    AlertAlreadyResolved,
    AttemptNotRecorded,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommandFailed => "command_failed",
            Self::CommandTimeout => "command_timeout",
            Self::TransportError => "transport_error",
            Self::VerificationFailed => "verification_failed",
            Self::AlertAlreadyResolved => "alert_already_resolved",
            Self::AttemptNotRecorded => "attempt_not_recorded",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert lifecycle as reported by the monitoring system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Acknowledged,
    Resolved,
}

/// Direction in which an alert's threshold is breached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    #[default]
    Above,
    Below,
}

impl Comparison {
    /// Whether `value` breaches `threshold` in this direction.
    #[must_use]
    pub fn breached(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value >= threshold,
            Self::Below => value <= threshold,
        }
    }
}

/// An alert record (read-only; owned by the monitoring system).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub host_id: String,
    /// Metric that fired, e.g. `disk_percent`
    pub metric: String,
    pub severity: String,
    pub status: AlertStatus,
    /// Value observed when the alert fired
    #[serde(default)]
    pub value: Option<f64>,
    /// Threshold of the rule that fired
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub comparison: Comparison,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub fired_at: DateTime<Utc>,
}

impl Alert {
    #[must_use]
    pub fn is_firing(&self) -> bool {
        self.status == AlertStatus::Firing
    }

    /// Lowercased free text used for keyword matching.
    #[must_use]
    pub fn match_text(&self) -> String {
        let mut labels: Vec<_> = self.labels.iter().collect();
        labels.sort();

        let mut text = self.message.to_lowercase();
        for (key, value) in labels {
            text.push(' ');
            text.push_str(&key.to_lowercase());
            text.push('=');
            text.push_str(&value.to_lowercase());
        }
        text
    }
}

/// A monitored host (read-only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub hostname: String,
    /// Address used by the command transport
    pub address: String,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
}

/// Kind of event on the alert feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertEventKind {
    Fired,
    Resolved,
    Acknowledged,
}

/// Event from the alert feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertEventKind,
    pub alert_id: String,
    pub host_id: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default = "Utc::now")]
    pub fired_at: DateTime<Utc>,
}

/// Who started a remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "lowercase")]
pub enum TriggeredBy {
    Auto,
    Manual(String),
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Manual(user) => write!(f, "user:{user}"),
        }
    }
}

/// A request to remediate one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub alert_id: String,
    pub host_id: String,
    pub triggered_by: TriggeredBy,
    pub created_at: DateTime<Utc>,
}

impl RemediationRequest {
    /// Request raised automatically from a fired alert.
    #[must_use]
    pub fn auto(alert_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        Self {
            alert_id: alert_id.into(),
            host_id: host_id.into(),
            triggered_by: TriggeredBy::Auto,
            created_at: Utc::now(),
        }
    }

    /// Request raised by an operator.
    #[must_use]
    pub fn manual(alert: &Alert, user_id: impl Into<String>) -> Self {
        Self {
            alert_id: alert.id.clone(),
            host_id: alert.host_id.clone(),
            triggered_by: TriggeredBy::Manual(user_id.into()),
            created_at: Utc::now(),
        }
    }
}

impl From<&AlertEvent> for RemediationRequest {
    fn from(event: &AlertEvent) -> Self {
        Self::auto(event.alert_id.clone(), event.host_id.clone())
    }
}

/// Structured diagnosis produced by the reasoning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub summary: String,
    pub root_cause: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub recommended_runbook: Option<String>,
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Set when the command was not sent (dry run)
    #[serde(default)]
    pub simulated: bool,
}

impl CommandResult {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Durable audit record for one remediation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub id: Uuid,
    pub alert_id: String,
    pub host_id: String,
    pub status: RemediationStatus,
    pub risk_level: Option<RiskLevel>,
    pub runbook_name: Option<String>,
    pub diagnosis: Option<Diagnosis>,
    pub command_results: Vec<CommandResult>,
    pub verification_passed: Option<bool>,
    pub blocked_reason: Option<BlockReason>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    pub triggered_by: TriggeredBy,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RemediationRecord {
    /// Create a pending record for an admitted request.
    #[must_use]
    pub fn new(request: &RemediationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_id: request.alert_id.clone(),
            host_id: request.host_id.clone(),
            status: RemediationStatus::Pending,
            risk_level: None,
            runbook_name: None,
            diagnosis: None,
            command_results: Vec::new(),
            verification_passed: None,
            blocked_reason: None,
            failure_reason: None,
            triggered_by: request.triggered_by.clone(),
            approved_by: None,
            approved_at: None,
            dry_run: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move forward to `next`, stamping `completed_at` on terminal states.
    pub fn advance(&mut self, next: RemediationStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                record_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Terminate as blocked.
    pub fn block(&mut self, reason: BlockReason) -> Result<(), TransitionError> {
        self.advance(RemediationStatus::Blocked)?;
        self.blocked_reason = Some(reason);
        Ok(())
    }

    /// Terminate as failed.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        self.advance(RemediationStatus::Failed)?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    /// Record the runbook selected for this attempt.
    pub fn set_matched(
        &mut self,
        runbook: &str,
        risk_level: RiskLevel,
    ) -> Result<(), TransitionError> {
        self.advance(RemediationStatus::Matched)?;
        self.runbook_name = Some(runbook.to_string());
        self.risk_level = Some(risk_level);
        Ok(())
    }

    /// Record human approval. Only valid while matched.
    pub fn approve(&mut self, user_id: &str, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != RemediationStatus::Matched {
            return Err(TransitionError {
                record_id: self.id,
                from: self.status,
                to: RemediationStatus::Executing,
            });
        }
        self.approved_by = Some(user_id.to_string());
        self.approved_at = Some(at);
        Ok(())
    }

    /// Append a command result. Only valid while executing.
    pub fn push_command_result(&mut self, result: CommandResult) -> Result<(), TransitionError> {
        if self.status != RemediationStatus::Executing {
            return Err(TransitionError {
                record_id: self.id,
                from: self.status,
                to: RemediationStatus::Executing,
            });
        }
        self.command_results.push(result);
        Ok(())
    }

    /// The machine-readable reason for a blocked or failed outcome.
    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        self.blocked_reason
            .map(BlockReason::as_str)
            .or_else(|| self.failure_reason.map(FailureReason::as_str))
    }

    /// Wall-clock time from start to completion (or now, while in flight).
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at.unwrap_or_else(Utc::now) - self.started_at
    }
}
