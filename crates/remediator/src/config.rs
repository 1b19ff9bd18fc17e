//! Runtime configuration.
//!
//! Loaded from an optional JSON file; every section and field has a default
//! so a partial file (or none at all) is valid. Operational policy values
//! (confidence threshold, blacklist, rate limits, circuit thresholds) live
//! here rather than in code.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediatorConfig {
    pub matcher: MatcherConfig,
    pub safety: SafetyConfig,
    pub circuit: CircuitConfig,
    pub executor: ExecutorConfig,
    pub diagnosis: DiagnosisConfig,
    pub verification: VerificationConfig,
    pub persistence: PersistenceConfig,
    pub dispatch: DispatchConfig,
    pub sources: SourcesConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum diagnosis confidence to trust a recommended runbook
    pub confidence_threshold: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Replaces the built-in blacklist when set
    pub blacklist: Option<Vec<String>>,
    /// Appended to the blacklist in effect
    pub extra_blacklist: Vec<String>,
    /// Executions of one runbook on one host allowed per window
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    /// How long a CONFIRM runbook waits for approval before being denied
    pub approval_timeout_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blacklist: None,
            extra_blacklist: Vec::new(),
            rate_limit_max: 3,
            rate_limit_window_secs: 3600,
            approval_timeout_secs: 900,
        }
    }
}

impl SafetyConfig {
    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    #[must_use]
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failed outcomes that open the breaker
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 1800,
        }
    }
}

impl CircuitConfig {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub command_timeout_secs: u64,
    /// Per-stream cap on captured stdout/stderr
    pub output_limit_bytes: usize,
    pub dry_run: bool,
    /// SSH connect timeout for the remote transport
    pub connect_timeout_secs: u64,
    pub ssh_identity_file: Option<String>,
    pub ssh_user: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 60,
            output_limit_bytes: 4096,
            dry_run: false,
            connect_timeout_secs: 10,
            ssh_identity_file: None,
            ssh_user: None,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    /// Reasoning service endpoint; diagnosis is skipped when unset
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl DiagnosisConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Wait before re-reading the metric
    pub settle_secs: u64,
    pub timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            settle_secs: 10,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: String,
    /// Attempts for a terminal write before escalating
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Upper bound on delivering an unpersisted outcome
    pub escalation_timeout_secs: u64,
}

impl PersistenceConfig {
    #[must_use]
    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_secs(self.escalation_timeout_secs)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: "remediations.jsonl".to_string(),
            max_retries: 5,
            initial_backoff_ms: 200,
            escalation_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub max_concurrent: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_concurrent: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Monitoring REST API serving alerts and hosts
    pub monitor_url: String,
    pub prometheus_url: String,
    /// Label carrying the host id on Prometheus series
    pub host_label: String,
    pub timeout_secs: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            monitor_url: "http://localhost:8000".to_string(),
            prometheus_url: "http://localhost:9090".to_string(),
            host_label: "host".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8090".to_string(),
        }
    }
}

impl RemediatorConfig {
    /// Load configuration from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Reject values that would disable a safety property.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.matcher.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("matcher.confidence_threshold must be within [0, 1], got {threshold}");
        }
        if self.safety.rate_limit_window_secs == 0 {
            bail!("safety.rate_limit_window_secs must be positive");
        }
        if self.circuit.failure_threshold == 0 {
            bail!("circuit.failure_threshold must be positive");
        }
        if self.executor.command_timeout_secs == 0 {
            bail!("executor.command_timeout_secs must be positive");
        }
        if self.persistence.max_retries == 0 {
            bail!("persistence.max_retries must be positive");
        }
        if self.persistence.escalation_timeout_secs == 0 {
            bail!("persistence.escalation_timeout_secs must be positive");
        }
        if self.dispatch.queue_capacity == 0 || self.dispatch.max_concurrent == 0 {
            bail!("dispatch.queue_capacity and dispatch.max_concurrent must be positive");
        }
        for pattern in self.blacklist_patterns() {
            Regex::new(&pattern)
                .with_context(|| format!("Invalid blacklist pattern: {pattern}"))?;
        }
        Ok(())
    }

    /// The blacklist in effect: configured or built-in, plus extras.
    #[must_use]
    pub fn blacklist_patterns(&self) -> Vec<String> {
        let mut patterns = self.safety.blacklist.clone().unwrap_or_else(|| {
            crate::gate::BUILTIN_BLACKLIST
                .iter()
                .map(ToString::to_string)
                .collect()
        });
        patterns.extend(self.safety.extra_blacklist.iter().cloned());
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = RemediatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.safety.rate_limit_max, 3);
        assert_eq!(config.circuit.failure_threshold, 3);
        assert!((config.matcher.confidence_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"matcher": {{"confidence_threshold": 0.8}}, "safety": {{"extra_blacklist": ["\\biptables\\s+-F\\b"]}}}}"#
        )
        .unwrap();

        let config = RemediatorConfig::load(Some(file.path())).unwrap();
        assert!((config.matcher.confidence_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.executor.command_timeout_secs, 60);
        let patterns = config.blacklist_patterns();
        assert_eq!(patterns.len(), crate::gate::BUILTIN_BLACKLIST.len() + 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = RemediatorConfig::default();
        config.matcher.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_blacklist_regex_rejected() {
        let mut config = RemediatorConfig::default();
        config.safety.extra_blacklist = vec!["(unclosed".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_escalation_timeout_rejected() {
        let mut config = RemediatorConfig::default();
        assert_eq!(config.persistence.escalation_timeout(), Duration::from_secs(30));
        config.persistence.escalation_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = RemediatorConfig::load(Some(Path::new("/nonexistent/remediator.json")));
        assert!(err.is_err());
    }
}
