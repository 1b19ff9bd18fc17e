//! Safety gate.
//!
//! An ordered list of pure checks over a snapshot of the host's safety
//! state. The first check that objects decides the outcome; later checks
//! are never consulted. Order matters: circuit, risk, command content,
//! rate, approval.

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::registry::RunbookDefinition;
use crate::state::{CircuitBreakerState, RateLimiterState};
use crate::types::{BlockReason, RiskLevel};

/// Destructive command patterns denied regardless of risk level.
pub const BUILTIN_BLACKLIST: &[&str] = &[
    // recursive delete of root, home, wildcards or top-level system dirs
    r"\brm\s+(-[A-Za-z]*\s+)*-[A-Za-z]*[rR][A-Za-z]*\s+(-[A-Za-z]*\s+)*(/|/\*|~/?|\*|/(bin|boot|dev|etc|home|lib|lib64|opt|proc|root|sbin|srv|sys|usr|var)/?)(\s|$)",
    r"\b(shutdown|reboot|halt|poweroff)\b",
    r"\binit\s+[06]\b",
    r"\bsystemctl\s+(reboot|poweroff|halt|kexec)\b",
    r"\bmkfs(\.[a-z0-9]+)?\b",
    r"\bdd\b.*\bof=/dev/",
    r"\b(fdisk|sfdisk|parted|wipefs)\b",
    r">\s*/dev/(sd|hd|vd|xvd|nvme)[a-z0-9]*",
    r":\(\)\s*\{\s*:\|:&\s*\};:",
    r"\bchmod\s+(-[A-Za-z]*\s+)*-R\s+0?777\s+/(\s|$)",
    r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
];

/// Recorded human approval of a CONFIRM runbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub user_id: String,
    pub approved_at: DateTime<Utc>,
}

/// Everything one gate evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub runbook: &'a RunbookDefinition,
    /// Rendered commands in runbook order; `None` when rendering failed
    pub commands: Option<&'a [String]>,
    pub circuit: &'a CircuitBreakerState,
    pub rate: &'a RateLimiterState,
    pub approval: Option<&'a Approval>,
    pub now: DateTime<Utc>,
}

/// Gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Admit,
    Deny(BlockReason),
    /// CONFIRM runbook with no approval yet
    AwaitApproval,
}

/// Result of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Pass,
    Deny(BlockReason),
    Hold,
}

type CheckFn = fn(&SafetyGate, &GateInput<'_>) -> Check;

const CHECKS: &[(&str, CheckFn)] = &[
    ("circuit", SafetyGate::check_circuit),
    ("risk", SafetyGate::check_risk),
    ("commands", SafetyGate::check_commands),
    ("rate", SafetyGate::check_rate),
    ("approval", SafetyGate::check_approval),
];

/// Stateless evaluator; all mutable state arrives in [`GateInput`].
#[derive(Debug)]
pub struct SafetyGate {
    blacklist: Vec<Regex>,
    rate_limit_max: u32,
}

impl SafetyGate {
    /// Compile the gate from blacklist patterns.
    pub fn new(blacklist: &[String], rate_limit_max: u32) -> Result<Self, regex::Error> {
        let blacklist = blacklist
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            blacklist,
            rate_limit_max,
        })
    }

    /// The first blacklist pattern `command` matches, if any.
    #[must_use]
    pub fn blacklisted(&self, command: &str) -> Option<&str> {
        self.blacklist
            .iter()
            .find(|re| re.is_match(command))
            .map(Regex::as_str)
    }

    /// Run every check in order, stopping at the first that objects.
    #[must_use]
    pub fn evaluate(&self, input: &GateInput<'_>) -> GateDecision {
        for &(name, check) in CHECKS {
            match check(self, input) {
                Check::Pass => {
                    debug!(check = name, runbook = %input.runbook.id, "Gate check passed");
                }
                Check::Deny(reason) => {
                    warn!(
                        check = name,
                        runbook = %input.runbook.id,
                        reason = reason.as_str(),
                        "Safety gate denied remediation"
                    );
                    return GateDecision::Deny(reason);
                }
                Check::Hold => return GateDecision::AwaitApproval,
            }
        }
        GateDecision::Admit
    }

    fn check_circuit(&self, input: &GateInput<'_>) -> Check {
        if input.circuit.is_open(input.now) {
            Check::Deny(BlockReason::CircuitOpen)
        } else {
            Check::Pass
        }
    }

    fn check_risk(&self, input: &GateInput<'_>) -> Check {
        if input.runbook.risk_level == RiskLevel::Block {
            Check::Deny(BlockReason::RiskBlocked)
        } else {
            Check::Pass
        }
    }

    /// Blacklist across every command first, then the per-command whitelist.
    fn check_commands(&self, input: &GateInput<'_>) -> Check {
        let Some(commands) = input.commands else {
            return Check::Deny(BlockReason::InvalidCommandTemplate);
        };
        if let Some((command, pattern)) = commands
            .iter()
            .find_map(|c| self.blacklisted(c).map(|p| (c, p)))
        {
            warn!(command = %command, pattern, "Command matches blacklist");
            return Check::Deny(BlockReason::BlacklistViolation);
        }

        if commands.len() != input.runbook.commands.len() {
            return Check::Deny(BlockReason::CommandNotAllowed);
        }
        for (command, template) in commands.iter().zip(&input.runbook.commands) {
            if !template.expected_safe.is_match(command) {
                warn!(
                    command = %command,
                    expected = template.expected_safe.as_str(),
                    "Command does not match its expected-safe pattern"
                );
                return Check::Deny(BlockReason::CommandNotAllowed);
            }
        }
        Check::Pass
    }

    fn check_rate(&self, input: &GateInput<'_>) -> Check {
        if input.rate.count_in_window >= self.rate_limit_max {
            Check::Deny(BlockReason::RateLimited)
        } else {
            Check::Pass
        }
    }

    fn check_approval(&self, input: &GateInput<'_>) -> Check {
        if input.runbook.risk_level == RiskLevel::Confirm && input.approval.is_none() {
            Check::Hold
        } else {
            Check::Pass
        }
    }
}
