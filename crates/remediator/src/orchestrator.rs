//! Remediation orchestrator.
//!
//! Drives one record per request through
//! `pending -> diagnosing -> matched -> executing -> verifying -> outcome`,
//! terminating early as `blocked` whenever matching or the safety gate
//! objects. Execution against a host is serialized by a per-host lock taken
//! at the matched -> executing step and held until the terminal write.
//!
//! An outcome that cannot be persisted is escalated only after the host
//! lock is released, and never for longer than the escalation timeout.
//!
//! The gate runs twice: once before the lock (so CONFIRM runbooks can wait
//! for approval without holding it) and again under the lock against fresh
//! safety state, which is the decision that actually admits execution.

use chrono::Utc;
use notify::{Notifier, NotifyEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RemediatorConfig;
use crate::diagnosis::{DiagnosisClient, DiagnosisError, DiagnosisRequest};
use crate::error::RemediationError;
use crate::executor::{CommandExecutor, ExecutionOutcome};
use crate::gate::{Approval, GateDecision, GateInput, SafetyGate};
use crate::matcher::RunbookMatcher;
use crate::registry::{RunbookDefinition, RunbookRegistry};
use crate::source::AlertSource;
use crate::state::SafetyStateStore;
use crate::store::{commit_with_retry, RecordStore, RetryPolicy};
use crate::telemetry::TelemetrySource;
use crate::templates::CommandRenderer;
use crate::transport::CommandTransport;
use crate::types::{
    Alert, BlockReason, Diagnosis, FailureReason, Host, RemediationRecord, RemediationRequest,
    RemediationStatus,
};
use crate::verify::VerificationEngine;

/// Orchestrator knobs taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub dry_run: bool,
    pub approval_timeout: Duration,
    pub diagnosis_timeout: Duration,
    pub escalation_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Settings {
    #[must_use]
    pub fn from_config(config: &RemediatorConfig) -> Self {
        Self {
            dry_run: config.executor.dry_run,
            approval_timeout: config.safety.approval_timeout(),
            diagnosis_timeout: config.diagnosis.timeout(),
            escalation_timeout: config.persistence.escalation_timeout(),
            retry: RetryPolicy {
                max_attempts: config.persistence.max_retries,
                initial_backoff: Duration::from_millis(config.persistence.initial_backoff_ms),
            },
        }
    }
}

/// External collaborators.
pub struct Dependencies {
    pub alerts: Arc<dyn AlertSource>,
    /// Diagnosis is skipped entirely when unset
    pub diagnosis: Option<Arc<dyn DiagnosisClient>>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub transport: Arc<dyn CommandTransport>,
    pub records: Arc<dyn RecordStore>,
    pub safety: Arc<dyn SafetyStateStore>,
    pub notifier: Arc<Notifier>,
}

/// One live remediation, keyed by alert id.
struct InFlight {
    record_id: Uuid,
    cancel: CancellationToken,
}

/// Releases the alert's in-flight slot however the attempt ends.
struct InFlightGuard<'a> {
    live: &'a Mutex<HashMap<String, InFlight>>,
    alert_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.alert_id);
    }
}

/// Exclusive execution locks, one per host.
///
/// Entries live only while someone holds or waits for them.
#[derive(Default)]
struct HostLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HostLocks {
    async fn acquire(&self, host_id: &str) -> HostGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(host_id.to_string()).or_default())
        };
        HostGuard {
            guard: Some(lock.lock_owned().await),
            host_id: host_id.to_string(),
            locks: self,
        }
    }

    /// Drop the host's entry if nothing references it anymore.
    fn prune(&self, host_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(host_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(host_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct HostGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    host_id: String,
    locks: &'a HostLocks,
}

impl Drop for HostGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(&self.host_id);
    }
}

/// The remediation engine.
pub struct Orchestrator {
    registry: Arc<RunbookRegistry>,
    matcher: RunbookMatcher,
    gate: SafetyGate,
    renderer: CommandRenderer,
    executor: CommandExecutor,
    verifier: VerificationEngine,
    alerts: Arc<dyn AlertSource>,
    diagnosis: Option<Arc<dyn DiagnosisClient>>,
    telemetry: Arc<dyn TelemetrySource>,
    records: Arc<dyn RecordStore>,
    safety: Arc<dyn SafetyStateStore>,
    notifier: Arc<Notifier>,
    settings: Settings,
    live: Mutex<HashMap<String, InFlight>>,
    approvals: Mutex<HashMap<Uuid, oneshot::Sender<Approval>>>,
    host_locks: HostLocks,
}

impl Orchestrator {
    /// Build the engine. Fails only if a blacklist pattern does not compile.
    pub fn new(
        config: &RemediatorConfig,
        registry: Arc<RunbookRegistry>,
        deps: Dependencies,
    ) -> Result<Self, regex::Error> {
        let gate = SafetyGate::new(&config.blacklist_patterns(), config.safety.rate_limit_max)?;
        let executor = CommandExecutor::new(
            deps.transport,
            config.executor.command_timeout(),
            config.executor.output_limit_bytes,
        );
        let verifier = VerificationEngine::new(
            Arc::clone(&deps.telemetry),
            Duration::from_secs(config.verification.settle_secs),
            Duration::from_secs(config.verification.timeout_secs),
        );

        Ok(Self {
            matcher: RunbookMatcher::new(Arc::clone(&registry), config.matcher.confidence_threshold),
            registry,
            gate,
            renderer: CommandRenderer::new(),
            executor,
            verifier,
            alerts: deps.alerts,
            diagnosis: deps.diagnosis,
            telemetry: deps.telemetry,
            records: deps.records,
            safety: deps.safety,
            notifier: deps.notifier,
            settings: Settings::from_config(config),
            live: Mutex::new(HashMap::new()),
            approvals: Mutex::new(HashMap::new()),
            host_locks: HostLocks::default(),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &RunbookRegistry {
        &self.registry
    }

    #[must_use]
    pub fn dry_run(&self) -> bool {
        self.settings.dry_run
    }

    /// Run one request to a terminal state and return the committed record.
    ///
    /// Rejected without creating a record if the alert already has a live
    /// remediation.
    pub async fn handle(
        &self,
        request: RemediationRequest,
    ) -> Result<RemediationRecord, RemediationError> {
        let mut record = RemediationRecord::new(&request);
        record.dry_run = self.settings.dry_run;

        let cancel = CancellationToken::new();
        let _slot = self.admit(&record, cancel.clone())?;

        if let Err(e) = self.records.create(&record).await {
            error!(record_id = %record.id, alert_id = %record.alert_id, error = %e, "Failed to create remediation record");
            return Err(e.into());
        }
        info!(
            record_id = %record.id,
            alert_id = %record.alert_id,
            host = %record.host_id,
            triggered_by = %record.triggered_by,
            dry_run = record.dry_run,
            "Remediation admitted"
        );

        let result = self.run(record, &cancel).await;
        if let Err(RemediationError::PersistenceExhausted { record, source, .. }) = &result {
            self.escalate(record, source).await;
        }
        result
    }

    /// Operator-triggered remediation of an existing alert.
    pub async fn request_manual(
        &self,
        alert_id: &str,
        user_id: &str,
    ) -> Result<RemediationRecord, RemediationError> {
        let request = self.manual_request(alert_id, user_id).await?;
        self.handle(request).await
    }

    /// Build an operator request, checking the alert exists.
    pub async fn manual_request(
        &self,
        alert_id: &str,
        user_id: &str,
    ) -> Result<RemediationRequest, RemediationError> {
        let alert = self
            .alerts
            .fetch_alert(alert_id)
            .await?
            .ok_or_else(|| RemediationError::AlertNotFound(alert_id.to_string()))?;
        Ok(RemediationRequest::manual(&alert, user_id))
    }

    /// Record id of the live remediation for an alert, if any.
    #[must_use]
    pub fn in_flight(&self, alert_id: &str) -> Option<Uuid> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alert_id)
            .map(|entry| entry.record_id)
    }

    /// Signal that the alert was resolved or acknowledged.
    ///
    /// Work that has not started executing is abandoned; a running command
    /// sequence finishes but skips verification. Returns whether anything
    /// was in flight for the alert.
    pub fn cancel(&self, alert_id: &str) -> bool {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        match live.get(alert_id) {
            Some(entry) => {
                info!(alert_id, record_id = %entry.record_id, "Cancelling remediation for withdrawn alert");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Approve a CONFIRM runbook that is waiting for sign-off.
    pub async fn approve(&self, record_id: Uuid, user_id: &str) -> Result<(), RemediationError> {
        let waiting = self.approvals().remove(&record_id);
        if let Some(sender) = waiting {
            let approval = Approval {
                user_id: user_id.to_string(),
                approved_at: Utc::now(),
            };
            if sender.send(approval).is_ok() {
                info!(record_id = %record_id, user_id, "Remediation approved");
                return Ok(());
            }
        }

        match self.records.get(record_id).await? {
            Some(record) => {
                warn!(record_id = %record_id, status = %record.status, user_id, "Rejected approval");
                Err(RemediationError::InvalidApproval {
                    record_id,
                    status: record.status,
                })
            }
            None => Err(RemediationError::RecordNotFound(record_id)),
        }
    }

    /// Records currently waiting for approval.
    #[must_use]
    pub fn awaiting_approval(&self) -> Vec<Uuid> {
        self.approvals().keys().copied().collect()
    }

    pub async fn get(&self, record_id: Uuid) -> Result<Option<RemediationRecord>, RemediationError> {
        Ok(self.records.get(record_id).await?)
    }

    pub async fn list_for_host(
        &self,
        host_id: &str,
    ) -> Result<Vec<RemediationRecord>, RemediationError> {
        Ok(self.records.list_for_host(host_id).await?)
    }

    fn approvals(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Approval>>> {
        self.approvals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(
        &self,
        record: &RemediationRecord,
        cancel: CancellationToken,
    ) -> Result<InFlightGuard<'_>, RemediationError> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = live.get(&record.alert_id) {
            info!(alert_id = %record.alert_id, existing = %existing.record_id, "Rejected duplicate remediation request");
            return Err(RemediationError::AlreadyInFlight {
                alert_id: record.alert_id.clone(),
                record_id: existing.record_id.to_string(),
            });
        }
        live.insert(
            record.alert_id.clone(),
            InFlight {
                record_id: record.id,
                cancel,
            },
        );
        Ok(InFlightGuard {
            live: &self.live,
            alert_id: record.alert_id.clone(),
        })
    }

    async fn run(
        &self,
        mut record: RemediationRecord,
        cancel: &CancellationToken,
    ) -> Result<RemediationRecord, RemediationError> {
        let host_id = record.host_id.clone();
        self.transition(&mut record, RemediationStatus::Diagnosing).await?;

        let (alert, host) = match self.load_target(&record).await {
            Ok(target) => target,
            Err(reason) => return self.block(record, reason).await,
        };

        let diagnosis = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            diagnosis = self.diagnose(&alert) => Some(diagnosis),
        };
        let Some(diagnosis) = diagnosis else {
            return self.block(record, BlockReason::AlertResolvedBeforeAction).await;
        };
        record.diagnosis = diagnosis;

        let runbook = match self.matcher.select(record.diagnosis.as_ref(), &alert) {
            Ok(selected) => {
                info!(
                    record_id = %record.id,
                    runbook = %selected.runbook.id,
                    source = ?selected.source,
                    risk = %selected.runbook.risk_level,
                    "Runbook matched"
                );
                selected.runbook
            }
            Err(e) => {
                info!(record_id = %record.id, error = %e, "No runbook matched");
                return self.block(record, BlockReason::NoMatchingRunbook).await;
            }
        };
        record.set_matched(&runbook.id, runbook.risk_level)?;
        self.checkpoint(&record).await;

        let commands = match self.renderer.render(&runbook, &alert) {
            Ok(commands) => Some(commands),
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "Failed to render runbook commands");
                None
            }
        };

        let approval = match self
            .evaluate(&runbook, commands.as_deref(), &host_id, None)
            .await
        {
            GateDecision::Admit => None,
            GateDecision::Deny(reason) => return self.block(record, reason).await,
            GateDecision::AwaitApproval => match self.await_approval(&record, &runbook, cancel).await {
                Ok(approval) => {
                    record.approve(&approval.user_id, approval.approved_at)?;
                    self.checkpoint(&record).await;
                    Some(approval)
                }
                Err(reason) => return self.block(record, reason).await,
            },
        };

        let guard = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            guard = self.host_locks.acquire(&host_id) => Some(guard),
        };
        let Some(host_guard) = guard else {
            self.host_locks.prune(&host_id);
            return self.block(record, BlockReason::AlertResolvedBeforeAction).await;
        };
        debug!(record_id = %record.id, host = %host_id, "Acquired host lock");

        let result = self
            .execute_locked(record, &runbook, commands, approval.as_ref(), &alert, &host, cancel)
            .await;
        drop(host_guard);
        result
    }

    /// Everything from the final gate decision to the terminal write.
    async fn execute_locked(
        &self,
        mut record: RemediationRecord,
        runbook: &RunbookDefinition,
        commands: Option<Vec<String>>,
        approval: Option<&Approval>,
        alert: &Alert,
        host: &Host,
        cancel: &CancellationToken,
    ) -> Result<RemediationRecord, RemediationError> {
        match self
            .evaluate(runbook, commands.as_deref(), &host.id, approval)
            .await
        {
            GateDecision::Admit => {}
            GateDecision::Deny(reason) => return self.block(record, reason).await,
            GateDecision::AwaitApproval => {
                return self.block(record, BlockReason::ApprovalTimeout).await;
            }
        }
        if cancel.is_cancelled() {
            return self.block(record, BlockReason::AlertResolvedBeforeAction).await;
        }
        let Some(commands) = commands else {
            return self.block(record, BlockReason::InvalidCommandTemplate).await;
        };

        self.transition(&mut record, RemediationStatus::Executing).await?;

        if cancel.is_cancelled() || !self.still_firing(&alert.id).await {
            info!(record_id = %record.id, alert_id = %alert.id, "Alert no longer firing, aborting before execution");
            record.fail(FailureReason::AlertAlreadyResolved)?;
            return self.finish(record).await;
        }

        if let Err(e) = self
            .safety
            .record_attempt(&host.id, &runbook.id, Utc::now())
            .await
        {
            error!(record_id = %record.id, error = %e, "Failed to count attempt, not executing");
            record.fail(FailureReason::AttemptNotRecorded)?;
            return self.finish(record).await;
        }

        let outcome = self
            .executor
            .execute(host, &commands, self.settings.dry_run, &mut record)
            .await?;

        match outcome {
            ExecutionOutcome::Failed(reason) => record.fail(reason)?,
            ExecutionOutcome::Completed if cancel.is_cancelled() => {
                info!(record_id = %record.id, "Alert withdrawn during execution, skipping verification");
                record.advance(RemediationStatus::Success)?;
            }
            ExecutionOutcome::Completed => {
                self.transition(&mut record, RemediationStatus::Verifying).await?;
                let passed = if self.settings.dry_run {
                    true
                } else {
                    self.verifier.verify(runbook.verification, alert).await
                };
                record.verification_passed = Some(passed);
                if passed {
                    record.advance(RemediationStatus::Success)?;
                } else {
                    record.fail(FailureReason::VerificationFailed)?;
                }
            }
        }

        self.finish(record).await
    }

    async fn load_target(&self, record: &RemediationRecord) -> Result<(Alert, Host), BlockReason> {
        let alert = match self.alerts.fetch_alert(&record.alert_id).await {
            Ok(Some(alert)) => alert,
            Ok(None) => {
                warn!(record_id = %record.id, alert_id = %record.alert_id, "Alert not found");
                return Err(BlockReason::TargetUnavailable);
            }
            Err(e) => {
                warn!(record_id = %record.id, alert_id = %record.alert_id, error = %e, "Failed to fetch alert");
                return Err(BlockReason::TargetUnavailable);
            }
        };
        if !alert.is_firing() {
            return Err(BlockReason::AlertResolvedBeforeAction);
        }

        match self.alerts.fetch_host(&record.host_id).await {
            Ok(Some(host)) => Ok((alert, host)),
            Ok(None) => {
                warn!(record_id = %record.id, host = %record.host_id, "Host not found");
                Err(BlockReason::TargetUnavailable)
            }
            Err(e) => {
                warn!(record_id = %record.id, host = %record.host_id, error = %e, "Failed to fetch host");
                Err(BlockReason::TargetUnavailable)
            }
        }
    }

    /// Best-effort diagnosis; every failure degrades to `None`.
    async fn diagnose(&self, alert: &Alert) -> Option<Diagnosis> {
        let client = self.diagnosis.as_ref()?;
        let timeout = self.settings.diagnosis_timeout;

        let excerpt = match tokio::time::timeout(
            timeout,
            self.telemetry.recent_excerpt(&alert.host_id, &alert.metric),
        )
        .await
        {
            Ok(Ok(excerpt)) => excerpt,
            Ok(Err(e)) => {
                debug!(alert_id = %alert.id, error = %e, "No telemetry excerpt for diagnosis");
                String::new()
            }
            Err(_) => String::new(),
        };

        let request = DiagnosisRequest {
            alert,
            excerpt: &excerpt,
            runbooks: self.registry.iter().map(|r| r.id.as_str()).collect(),
        };
        let result = tokio::time::timeout(timeout, client.diagnose(&request))
            .await
            .unwrap_or(Err(DiagnosisError::Timeout(timeout)));

        match result {
            Ok(diagnosis) => {
                info!(
                    alert_id = %alert.id,
                    confidence = diagnosis.confidence,
                    recommended = ?diagnosis.recommended_runbook,
                    "Diagnosis received"
                );
                Some(diagnosis)
            }
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "Diagnosis unavailable, using rule-based matching");
                None
            }
        }
    }

    /// Gate evaluation against a fresh snapshot of the host's safety state.
    async fn evaluate(
        &self,
        runbook: &RunbookDefinition,
        commands: Option<&[String]>,
        host_id: &str,
        approval: Option<&Approval>,
    ) -> GateDecision {
        let now = Utc::now();
        let snapshot = async {
            let circuit = self.safety.circuit(host_id, now).await?;
            let rate = self.safety.rate(host_id, &runbook.id, now).await?;
            Ok::<_, crate::state::StateError>((circuit, rate))
        };
        let (circuit, rate) = match snapshot.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(host = host_id, error = %e, "Safety state unavailable, denying");
                return GateDecision::Deny(BlockReason::SafetyStateUnavailable);
            }
        };

        self.gate.evaluate(&GateInput {
            runbook,
            commands,
            circuit: &circuit,
            rate: &rate,
            approval,
            now,
        })
    }

    async fn await_approval(
        &self,
        record: &RemediationRecord,
        runbook: &RunbookDefinition,
        cancel: &CancellationToken,
    ) -> Result<Approval, BlockReason> {
        let (sender, receiver) = oneshot::channel();
        self.approvals().insert(record.id, sender);

        let timeout = self.settings.approval_timeout;
        info!(
            record_id = %record.id,
            runbook = %runbook.id,
            timeout_secs = timeout.as_secs(),
            "Awaiting approval"
        );
        self.notifier.notify(NotifyEvent::ApprovalRequested {
            record_id: record.id.to_string(),
            alert_id: record.alert_id.clone(),
            host_id: record.host_id.clone(),
            runbook: runbook.id.clone(),
            timeout_secs: timeout.as_secs(),
            timestamp: Utc::now(),
        });

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BlockReason::AlertResolvedBeforeAction),
            received = tokio::time::timeout(timeout, receiver) => match received {
                Ok(Ok(approval)) => Ok(approval),
                Ok(Err(_)) | Err(_) => Err(BlockReason::ApprovalTimeout),
            },
        };
        self.approvals().remove(&record.id);
        outcome
    }

    /// Whether the alert is still firing right before execution.
    ///
    /// Anything short of a positive answer aborts.
    async fn still_firing(&self, alert_id: &str) -> bool {
        match self.alerts.fetch_alert(alert_id).await {
            Ok(Some(alert)) => alert.is_firing(),
            Ok(None) => false,
            Err(e) => {
                warn!(alert_id, error = %e, "Could not re-check alert before execution");
                false
            }
        }
    }

    async fn transition(
        &self,
        record: &mut RemediationRecord,
        next: RemediationStatus,
    ) -> Result<(), RemediationError> {
        record.advance(next)?;
        info!(record_id = %record.id, status = %next, "Remediation status changed");
        self.checkpoint(record).await;
        Ok(())
    }

    /// Non-terminal snapshot; the terminal write is the one that must land.
    async fn checkpoint(&self, record: &RemediationRecord) {
        if let Err(e) = self.records.update(record).await {
            warn!(record_id = %record.id, status = %record.status, error = %e, "Failed to persist record snapshot");
        }
    }

    async fn block(
        &self,
        mut record: RemediationRecord,
        reason: BlockReason,
    ) -> Result<RemediationRecord, RemediationError> {
        record.block(reason)?;
        warn!(
            record_id = %record.id,
            alert_id = %record.alert_id,
            host = %record.host_id,
            reason = reason.as_str(),
            "Remediation blocked"
        );
        self.finish(record).await
    }

    /// Update the breaker, commit durably, then notify.
    async fn finish(&self, record: RemediationRecord) -> Result<RemediationRecord, RemediationError> {
        let now = Utc::now();
        if matches!(record.status, RemediationStatus::Success | RemediationStatus::Failed) {
            let success = record.status == RemediationStatus::Success;
            match self.safety.record_outcome(&record.host_id, success, now).await {
                Ok(circuit) if circuit.is_open(now) => {
                    warn!(host = %record.host_id, failures = circuit.consecutive_failures, "Host circuit is open");
                }
                Ok(_) => {}
                Err(e) => error!(record_id = %record.id, error = %e, "Failed to update circuit breaker"),
            }
        }

        if let Err((attempts, source)) =
            commit_with_retry(self.records.as_ref(), &record, self.settings.retry).await
        {
            error!(
                record_id = %record.id,
                status = %record.status,
                attempts,
                error = %source,
                "Terminal outcome could not be persisted"
            );
            return Err(RemediationError::PersistenceExhausted {
                record_id: record.id,
                attempts,
                source,
                record: Box::new(record),
            });
        }

        info!(
            record_id = %record.id,
            status = %record.status,
            runbook = record.runbook_name.as_deref().unwrap_or("-"),
            reason = record.reason().unwrap_or("-"),
            commands = record.command_results.len(),
            "Remediation finished"
        );
        self.notifier.notify(finished_event(&record));
        Ok(record)
    }

    /// Push an unpersisted outcome through notifications, and the log as a last resort.
    async fn escalate(&self, record: &RemediationRecord, cause: &crate::store::StoreError) {
        let snapshot = serde_json::to_string(record).unwrap_or_else(|e| format!("<unserializable: {e}>"));
        let event = NotifyEvent::PersistenceEscalation {
            record_id: record.id.to_string(),
            host_id: record.host_id.clone(),
            status: record.status.as_str().to_string(),
            error: cause.to_string(),
            record: snapshot.clone(),
            timestamp: Utc::now(),
        };

        let delivered = match tokio::time::timeout(
            self.settings.escalation_timeout,
            self.notifier.notify_and_wait(event),
        )
        .await
        {
            Ok(results) => {
                for (channel, result) in &results {
                    if let Err(e) = result {
                        error!(channel = %channel, error = %e, "Escalation delivery failed");
                    }
                }
                results.iter().filter(|(_, r)| r.is_ok()).count()
            }
            Err(_) => {
                error!(
                    record_id = %record.id,
                    timeout = ?self.settings.escalation_timeout,
                    "Escalation delivery timed out"
                );
                0
            }
        };
        if delivered == 0 {
            error!(record_id = %record.id, record = %snapshot, "Escalation undeliverable; outcome recorded in log only");
        }
    }
}

fn finished_event(record: &RemediationRecord) -> NotifyEvent {
    NotifyEvent::RemediationFinished {
        record_id: record.id.to_string(),
        alert_id: record.alert_id.clone(),
        host_id: record.host_id.clone(),
        status: record.status.as_str().to_string(),
        runbook: record.runbook_name.clone(),
        reason: record.reason().map(ToString::to_string),
        duration_secs: record.duration().num_seconds().max(0) as u64,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_locks_are_exclusive_per_host() {
        let locks = HostLocks::default();
        let held = locks.acquire("h1").await;

        let blocked = tokio::time::timeout(Duration::from_millis(20), locks.acquire("h1")).await;
        assert!(blocked.is_err());

        let other = tokio::time::timeout(Duration::from_millis(20), locks.acquire("h2")).await;
        assert!(other.is_ok());

        drop(held);
        assert!(tokio::time::timeout(Duration::from_millis(20), locks.acquire("h1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_host_locks_are_pruned_on_release() {
        let locks = HostLocks::default();
        let first = locks.acquire("h1").await;
        let second = locks.acquire("h2").await;
        assert_eq!(locks.len(), 2);

        drop(first);
        assert_eq!(locks.len(), 1);
        drop(second);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_host_lock_kept_while_contended() {
        let locks = Arc::new(HostLocks::default());
        let held = locks.acquire("h1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("h1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the waiter still references the entry
        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_finished_event_carries_outcome() {
        let mut record = RemediationRecord::new(&RemediationRequest::auto("a1", "h1"));
        record.block(BlockReason::NoMatchingRunbook).unwrap();
        match finished_event(&record) {
            NotifyEvent::RemediationFinished {
                status,
                reason,
                runbook,
                ..
            } => {
                assert_eq!(status, "blocked");
                assert_eq!(reason.as_deref(), Some("no_matching_runbook"));
                assert!(runbook.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
