//! Runbook registry.
//!
//! The catalog is closed: runbooks are defined here, validated once at
//! startup and never mutated afterwards. Lookups and candidate ranking are
//! pure.

use regex::Regex;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{Alert, Diagnosis, RiskLevel};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Unknown runbook id
    #[error("runbook not found: {0}")]
    NotFound(String),

    /// Two runbooks registered under the same id
    #[error("duplicate runbook id: {0}")]
    Duplicate(String),

    /// A command's expected-safe pattern does not compile
    #[error("runbook {runbook}: invalid expected-safe pattern {pattern:?}: {source}")]
    InvalidPattern {
        runbook: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A runbook allowed to run has no commands
    #[error("runbook {0} has no commands")]
    Empty(String),
}

/// One command of a runbook.
#[derive(Debug, Clone, Serialize)]
pub struct CommandTemplate {
    /// Handlebars template rendered against the alert context
    pub template: String,
    /// The rendered command must match this
    #[serde(serialize_with = "serialize_regex")]
    pub expected_safe: Regex,
}

fn serialize_regex<S: Serializer>(regex: &Regex, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(regex.as_str())
}

/// Alert conditions a runbook applies to.
///
/// An empty metric list applies to every metric; an empty keyword list
/// places no constraint on the alert text.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchPredicate {
    pub metrics: Vec<String>,
    pub keywords: Vec<String>,
}

impl MatchPredicate {
    /// Whether the runbook may be used for alerts on `metric`.
    #[must_use]
    pub fn applies_to_metric(&self, metric: &str) -> bool {
        self.metrics.is_empty() || self.metrics.iter().any(|m| m == metric)
    }

    #[must_use]
    pub fn matches(&self, input: &MatchInput<'_>) -> bool {
        self.applies_to_metric(input.metric)
            && (self.keywords.is_empty()
                || self
                    .keywords
                    .iter()
                    .any(|k| contains_word(&input.text, &k.to_lowercase())))
    }

    /// Metric+keyword beats metric-only beats keyword-only beats generic.
    #[must_use]
    pub fn specificity(&self) -> u8 {
        u8::from(!self.metrics.is_empty()) * 2 + u8::from(!self.keywords.is_empty())
    }
}

/// Whether `word` occurs in `text` delimited by non-alphanumeric characters.
fn contains_word(text: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    text.match_indices(word).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + word.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// How to decide whether a remediation fixed the problem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationPredicate {
    /// The alert's own threshold no longer breached
    ThresholdCleared,
    /// Metric strictly below a fixed value
    Below { value: f64 },
    /// Metric strictly above a fixed value
    Above { value: f64 },
}

/// Immutable runbook definition.
#[derive(Debug, Clone, Serialize)]
pub struct RunbookDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub predicate: MatchPredicate,
    pub risk_level: RiskLevel,
    pub commands: Vec<CommandTemplate>,
    pub verification: VerificationPredicate,
}

/// What candidate ranking looks at.
#[derive(Debug, Clone)]
pub struct MatchInput<'a> {
    pub metric: &'a str,
    /// Lowercased free text searched for keywords
    pub text: String,
}

impl<'a> MatchInput<'a> {
    /// Rule-based input: metric and text from the alert alone.
    #[must_use]
    pub fn from_alert(alert: &'a Alert) -> Self {
        Self {
            metric: &alert.metric,
            text: alert.match_text(),
        }
    }

    /// Widen the searched text with a diagnosis' findings.
    #[must_use]
    pub fn with_diagnosis(mut self, diagnosis: &Diagnosis) -> Self {
        for part in [&diagnosis.summary, &diagnosis.root_cause] {
            self.text.push(' ');
            self.text.push_str(&part.to_lowercase());
        }
        self
    }
}

/// Catalog of runbooks in registration order.
#[derive(Debug)]
pub struct RunbookRegistry {
    runbooks: Vec<Arc<RunbookDefinition>>,
    index: HashMap<String, usize>,
}

impl RunbookRegistry {
    /// Build a registry, rejecting duplicate ids and empty runnable runbooks.
    pub fn new(runbooks: Vec<RunbookDefinition>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(runbooks.len());
        for (position, runbook) in runbooks.iter().enumerate() {
            if runbook.commands.is_empty() && runbook.risk_level != RiskLevel::Block {
                return Err(RegistryError::Empty(runbook.id.clone()));
            }
            if index.insert(runbook.id.clone(), position).is_some() {
                return Err(RegistryError::Duplicate(runbook.id.clone()));
            }
        }

        Ok(Self {
            runbooks: runbooks.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    /// The built-in catalog.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(builtin_catalog()?)
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<RunbookDefinition>, RegistryError> {
        self.index
            .get(id)
            .map(|&i| Arc::clone(&self.runbooks[i]))
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Matching runbooks, most specific first; ties keep registration order.
    #[must_use]
    pub fn match_candidates(&self, input: &MatchInput<'_>) -> Vec<Arc<RunbookDefinition>> {
        let mut candidates: Vec<_> = self
            .runbooks
            .iter()
            .filter(|r| r.predicate.matches(input))
            .cloned()
            .collect();
        // sort_by_key is stable
        candidates.sort_by_key(|r| std::cmp::Reverse(r.predicate.specificity()));
        candidates
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RunbookDefinition>> {
        self.runbooks.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runbooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runbooks.is_empty()
    }
}

/// Build a command template, compiling its expected-safe pattern.
pub fn command(
    runbook: &str,
    template: &str,
    expected_safe: &str,
) -> Result<CommandTemplate, RegistryError> {
    let expected_safe = Regex::new(expected_safe).map_err(|source| RegistryError::InvalidPattern {
        runbook: runbook.to_string(),
        pattern: expected_safe.to_string(),
        source,
    })?;
    Ok(CommandTemplate {
        template: template.to_string(),
        expected_safe,
    })
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

/// The built-in runbook catalog, in registration order.
pub fn builtin_catalog() -> Result<Vec<RunbookDefinition>, RegistryError> {
    Ok(vec![
        RunbookDefinition {
            id: "log_rotate".to_string(),
            name: "Rotate and compress logs".to_string(),
            description: "Force logrotate and vacuum the journal when logs fill the disk"
                .to_string(),
            predicate: MatchPredicate {
                metrics: strings(&["disk_percent"]),
                keywords: strings(&["log", "logs", "journal"]),
            },
            risk_level: RiskLevel::Auto,
            commands: vec![
                command(
                    "log_rotate",
                    "logrotate --force /etc/logrotate.conf",
                    r"^logrotate --force /etc/logrotate\.conf$",
                )?,
                command(
                    "log_rotate",
                    "journalctl --vacuum-size=200M",
                    r"^journalctl --vacuum-size=\d+M$",
                )?,
            ],
            verification: VerificationPredicate::ThresholdCleared,
        },
        RunbookDefinition {
            id: "disk_cleanup".to_string(),
            name: "Disk cleanup".to_string(),
            description: "Remove stale temporary files, package caches and old rotated logs"
                .to_string(),
            predicate: MatchPredicate {
                metrics: strings(&["disk_percent"]),
                keywords: Vec::new(),
            },
            risk_level: RiskLevel::Auto,
            commands: vec![
                command(
                    "disk_cleanup",
                    "find /tmp -xdev -type f -mtime +7 -delete",
                    r"^find /tmp -xdev -type f -mtime \+\d+ -delete$",
                )?,
                command(
                    "disk_cleanup",
                    "find /var/log -xdev -type f -name '*.gz' -mtime +14 -delete",
                    r"^find /var/log -xdev -type f -name '\*\.gz' -mtime \+\d+ -delete$",
                )?,
                command("disk_cleanup", "apt-get clean", r"^apt-get clean$")?,
            ],
            verification: VerificationPredicate::ThresholdCleared,
        },
        RunbookDefinition {
            id: "inode_cleanup".to_string(),
            name: "Inode cleanup".to_string(),
            description: "Remove orphaned session and cache files exhausting inodes".to_string(),
            predicate: MatchPredicate {
                metrics: strings(&["inode_percent"]),
                keywords: Vec::new(),
            },
            risk_level: RiskLevel::Auto,
            commands: vec![
                command(
                    "inode_cleanup",
                    "find /var/lib/php/sessions -xdev -type f -mmin +1440 -delete",
                    r"^find /var/lib/php/sessions -xdev -type f -mmin \+\d+ -delete$",
                )?,
                command(
                    "inode_cleanup",
                    "find /tmp -xdev -type f -size 0 -mtime +1 -delete",
                    r"^find /tmp -xdev -type f -size 0 -mtime \+\d+ -delete$",
                )?,
            ],
            verification: VerificationPredicate::ThresholdCleared,
        },
        RunbookDefinition {
            id: "memory_cache_drop".to_string(),
            name: "Drop page cache".to_string(),
            description: "Flush dirty pages and drop the kernel page cache".to_string(),
            predicate: MatchPredicate {
                metrics: strings(&["memory_percent"]),
                keywords: Vec::new(),
            },
            risk_level: RiskLevel::Confirm,
            commands: vec![
                command("memory_cache_drop", "sync", r"^sync$")?,
                command(
                    "memory_cache_drop",
                    "sysctl -w vm.drop_caches=1",
                    r"^sysctl -w vm\.drop_caches=[1-3]$",
                )?,
            ],
            verification: VerificationPredicate::ThresholdCleared,
        },
        RunbookDefinition {
            id: "service_restart".to_string(),
            name: "Restart service".to_string(),
            description: "Restart the systemd unit named by the alert's service label"
                .to_string(),
            predicate: MatchPredicate {
                metrics: strings(&["service_down", "process_down"]),
                keywords: Vec::new(),
            },
            risk_level: RiskLevel::Confirm,
            commands: vec![
                command(
                    "service_restart",
                    "systemctl restart {{service}}",
                    r"^systemctl restart [A-Za-z0-9_.@-]+$",
                )?,
                command(
                    "service_restart",
                    "systemctl is-active {{service}}",
                    r"^systemctl is-active [A-Za-z0-9_.@-]+$",
                )?,
            ],
            verification: VerificationPredicate::Below { value: 1.0 },
        },
        RunbookDefinition {
            id: "host_reboot".to_string(),
            name: "Reboot host".to_string(),
            description: "Listed so unresponsive hosts match a runbook; never executed"
                .to_string(),
            predicate: MatchPredicate {
                metrics: strings(&["host_unresponsive"]),
                keywords: Vec::new(),
            },
            risk_level: RiskLevel::Block,
            commands: vec![command("host_reboot", "systemctl reboot", r"^systemctl reboot$")?],
            verification: VerificationPredicate::ThresholdCleared,
        },
    ])
}
