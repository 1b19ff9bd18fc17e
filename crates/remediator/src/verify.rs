//! Post-execution verification.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::registry::VerificationPredicate;
use crate::telemetry::TelemetrySource;
use crate::types::Alert;

/// Re-reads the alerting metric and decides whether the problem is gone.
pub struct VerificationEngine {
    telemetry: Arc<dyn TelemetrySource>,
    /// Wait before re-reading, so the metric reflects the remediation
    settle: Duration,
    timeout: Duration,
}

impl VerificationEngine {
    #[must_use]
    pub fn new(telemetry: Arc<dyn TelemetrySource>, settle: Duration, timeout: Duration) -> Self {
        Self {
            telemetry,
            settle,
            timeout,
        }
    }

    /// Whether the condition that fired `alert` no longer holds.
    ///
    /// Anything that prevents a reading counts as not verified.
    pub async fn verify(&self, predicate: VerificationPredicate, alert: &Alert) -> bool {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let read = self.telemetry.current_value(&alert.host_id, &alert.metric);
        let value = match tokio::time::timeout(self.timeout, read).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(alert_id = %alert.id, metric = %alert.metric, error = %e, "Verification read failed");
                return false;
            }
            Err(_) => {
                warn!(alert_id = %alert.id, metric = %alert.metric, "Verification read timed out");
                return false;
            }
        };

        let passed = evaluate(predicate, alert, value);
        info!(
            alert_id = %alert.id,
            metric = %alert.metric,
            value,
            passed,
            "Verification complete"
        );
        passed
    }
}

/// Pure predicate evaluation against a fresh reading.
#[must_use]
pub fn evaluate(predicate: VerificationPredicate, alert: &Alert, value: f64) -> bool {
    match predicate {
        VerificationPredicate::ThresholdCleared => alert
            .threshold
            .is_some_and(|threshold| !alert.comparison.breached(value, threshold)),
        VerificationPredicate::Below { value: limit } => value < limit,
        VerificationPredicate::Above { value: limit } => value > limit,
    }
}
