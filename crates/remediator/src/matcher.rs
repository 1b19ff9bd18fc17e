//! Runbook selection.
//!
//! Picks exactly one runbook for an alert:
//! 1. A confident diagnosis naming a registered runbook that applies to the
//!    alert's metric wins outright
//! 2. Otherwise the top-ranked rule-based candidate for the alert, with a
//!    confident diagnosis' findings added to the text searched for keywords
//! 3. Otherwise matching fails and nothing runs

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::registry::{MatchInput, RunbookDefinition, RunbookRegistry};
use crate::types::{Alert, Diagnosis};

/// Where the selected runbook came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Diagnosis,
    Rules,
}

/// A selected runbook.
#[derive(Debug, Clone)]
pub struct RunbookMatch {
    pub runbook: Arc<RunbookDefinition>,
    pub source: MatchSource,
}

/// No runbook applies to the alert.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no runbook matches alert {alert_id} (metric {metric})")]
pub struct MatchFailure {
    pub alert_id: String,
    pub metric: String,
}

/// Deterministic diagnosis/rule matcher.
pub struct RunbookMatcher {
    registry: Arc<RunbookRegistry>,
    confidence_threshold: f64,
}

impl RunbookMatcher {
    #[must_use]
    pub fn new(registry: Arc<RunbookRegistry>, confidence_threshold: f64) -> Self {
        Self {
            registry,
            confidence_threshold,
        }
    }

    /// Select the runbook for `alert`.
    pub fn select(
        &self,
        diagnosis: Option<&Diagnosis>,
        alert: &Alert,
    ) -> Result<RunbookMatch, MatchFailure> {
        if let Some(runbook) = diagnosis.and_then(|d| self.from_diagnosis(d, alert)) {
            return Ok(RunbookMatch {
                runbook,
                source: MatchSource::Diagnosis,
            });
        }

        let mut input = MatchInput::from_alert(alert);
        if let Some(diagnosis) = diagnosis.filter(|d| d.confidence >= self.confidence_threshold) {
            input = input.with_diagnosis(diagnosis);
        }

        self.registry
            .match_candidates(&input)
            .into_iter()
            .next()
            .map(|runbook| RunbookMatch {
                runbook,
                source: MatchSource::Rules,
            })
            .ok_or_else(|| MatchFailure {
                alert_id: alert.id.clone(),
                metric: alert.metric.clone(),
            })
    }

    fn from_diagnosis(&self, diagnosis: &Diagnosis, alert: &Alert) -> Option<Arc<RunbookDefinition>> {
        if diagnosis.confidence < self.confidence_threshold {
            debug!(
                confidence = diagnosis.confidence,
                threshold = self.confidence_threshold,
                "Diagnosis below confidence threshold, using rules"
            );
            return None;
        }

        let id = diagnosis.recommended_runbook.as_deref()?;
        let Ok(runbook) = self.registry.lookup(id) else {
            debug!(runbook = id, "Diagnosis recommended unknown runbook, using rules");
            return None;
        };

        if !runbook.predicate.applies_to_metric(&alert.metric) {
            debug!(
                runbook = id,
                metric = %alert.metric,
                "Recommended runbook does not apply to alert metric, using rules"
            );
            return None;
        }

        Some(runbook)
    }
}
