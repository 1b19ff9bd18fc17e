//! In-memory fakes for driving the orchestrator end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use notify::{ChannelError, Notifier, NotifyChannel, NotifyEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remediator::diagnosis::{DiagnosisClient, DiagnosisError, DiagnosisRequest};
use remediator::orchestrator::{Dependencies, Orchestrator};
use remediator::registry::RunbookRegistry;
use remediator::source::{AlertSource, SourceError};
use remediator::state::InMemorySafetyStore;
use remediator::store::{InMemoryRecordStore, RecordStore, StoreError};
use remediator::telemetry::{TelemetryError, TelemetrySource};
use remediator::transport::{CommandOutput, CommandTransport, TransportError};
use remediator::types::{Alert, AlertStatus, Comparison, Diagnosis, Host, RemediationRecord};
use remediator::RemediatorConfig;
use uuid::Uuid;

/// Defaults with the slow parts (settle delay, persistence backoff) shrunk.
pub fn test_config() -> RemediatorConfig {
    let mut config = RemediatorConfig::default();
    config.verification.settle_secs = 0;
    config.persistence.max_retries = 3;
    config.persistence.initial_backoff_ms = 1;
    config
}

pub fn alert(id: &str, host_id: &str, metric: &str, value: f64, threshold: f64) -> Alert {
    Alert {
        id: id.to_string(),
        host_id: host_id.to_string(),
        metric: metric.to_string(),
        severity: "critical".to_string(),
        status: AlertStatus::Firing,
        value: Some(value),
        threshold: Some(threshold),
        comparison: Comparison::Above,
        message: format!("{metric} at {value}"),
        labels: HashMap::new(),
        fired_at: Utc::now(),
    }
}

pub fn diagnosis(confidence: f64, runbook: Option<&str>) -> Diagnosis {
    Diagnosis {
        summary: "test diagnosis".to_string(),
        root_cause: "test".to_string(),
        confidence,
        recommended_runbook: runbook.map(ToString::to_string),
    }
}

// ============================================================================
// Alert source
// ============================================================================

#[derive(Default)]
pub struct FakeAlerts {
    alerts: Mutex<HashMap<String, Alert>>,
    hosts: Mutex<HashMap<String, Host>>,
    fetches: Mutex<HashMap<String, usize>>,
    /// Alert ids reported resolved once fetched this many times
    resolve_after: Mutex<HashMap<String, usize>>,
}

impl FakeAlerts {
    /// Register the alert, and its host if unknown.
    pub fn fire(&self, alert: Alert) {
        self.hosts
            .lock()
            .unwrap()
            .entry(alert.host_id.clone())
            .or_insert_with(|| Host {
                id: alert.host_id.clone(),
                hostname: format!("{}.example.internal", alert.host_id),
                address: "10.0.0.1".to_string(),
                ssh_user: None,
                ssh_port: None,
            });
        self.alerts.lock().unwrap().insert(alert.id.clone(), alert);
    }

    pub fn set_status(&self, alert_id: &str, status: AlertStatus) {
        if let Some(alert) = self.alerts.lock().unwrap().get_mut(alert_id) {
            alert.status = status;
        }
    }

    pub fn resolve_after_fetches(&self, alert_id: &str, fetches: usize) {
        self.resolve_after
            .lock()
            .unwrap()
            .insert(alert_id.to_string(), fetches);
    }
}

#[async_trait]
impl AlertSource for FakeAlerts {
    async fn fetch_alert(&self, alert_id: &str) -> Result<Option<Alert>, SourceError> {
        let seen = {
            let mut fetches = self.fetches.lock().unwrap();
            let count = fetches.entry(alert_id.to_string()).or_default();
            *count += 1;
            *count
        };
        let resolve_at = self.resolve_after.lock().unwrap().get(alert_id).copied();

        let mut alert = self.alerts.lock().unwrap().get(alert_id).cloned();
        if let (Some(alert), Some(limit)) = (alert.as_mut(), resolve_at) {
            if seen > limit {
                alert.status = AlertStatus::Resolved;
            }
        }
        Ok(alert)
    }

    async fn fetch_host(&self, host_id: &str) -> Result<Option<Host>, SourceError> {
        Ok(self.hosts.lock().unwrap().get(host_id).cloned())
    }
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Default)]
pub struct FakeTelemetry {
    values: Mutex<HashMap<(String, String), f64>>,
}

impl FakeTelemetry {
    pub fn set(&self, host_id: &str, metric: &str, value: f64) {
        self.values
            .lock()
            .unwrap()
            .insert((host_id.to_string(), metric.to_string()), value);
    }
}

#[async_trait]
impl TelemetrySource for FakeTelemetry {
    async fn current_value(&self, host_id: &str, metric: &str) -> Result<f64, TelemetryError> {
        self.values
            .lock()
            .unwrap()
            .get(&(host_id.to_string(), metric.to_string()))
            .copied()
            .ok_or_else(|| TelemetryError::NoData {
                host_id: host_id.to_string(),
                metric: metric.to_string(),
            })
    }

    async fn recent_excerpt(&self, host_id: &str, metric: &str) -> Result<String, TelemetryError> {
        let value = self.current_value(host_id, metric).await?;
        Ok(format!("{metric} {value}"))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Records every command and tracks how many run at once per host.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<(String, String)>>,
    /// Commands containing one of these exit 1
    failing: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    running: Mutex<HashMap<String, usize>>,
    peak: Mutex<HashMap<String, usize>>,
}

impl RecordingTransport {
    pub fn fail_commands_containing(&self, needle: &str) {
        self.failing.lock().unwrap().push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands_for(&self, host_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(host, _)| host == host_id)
            .map(|(_, command)| command)
            .collect()
    }

    pub fn peak_concurrency(&self, host_id: &str) -> usize {
        self.peak.lock().unwrap().get(host_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CommandTransport for RecordingTransport {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((host.id.clone(), command.to_string()));
        {
            let mut running = self.running.lock().unwrap();
            let now = running.entry(host.id.clone()).or_default();
            *now += 1;
            let mut peak = self.peak.lock().unwrap();
            let high = peak.entry(host.id.clone()).or_default();
            *high = (*high).max(*now);
        }

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        *self.running.lock().unwrap().entry(host.id.clone()).or_default() -= 1;

        let fails = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|needle| command.contains(needle.as_str()));
        Ok(CommandOutput {
            exit_code: i32::from(fails),
            stdout: String::new(),
            stderr: if fails { "simulated failure".to_string() } else { String::new() },
            duration: delay,
        })
    }
}

// ============================================================================
// Diagnosis
// ============================================================================

/// Unavailable unless a diagnosis is set.
#[derive(Default)]
pub struct FakeDiagnosis {
    response: Mutex<Option<Diagnosis>>,
}

impl FakeDiagnosis {
    pub fn respond_with(&self, diagnosis: Diagnosis) {
        *self.response.lock().unwrap() = Some(diagnosis);
    }
}

#[async_trait]
impl DiagnosisClient for FakeDiagnosis {
    async fn diagnose(&self, _request: &DiagnosisRequest<'_>) -> Result<Diagnosis, DiagnosisError> {
        self.response
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DiagnosisError::Unavailable("no diagnosis configured".to_string()))
    }
}

// ============================================================================
// Record store
// ============================================================================

/// In-memory store whose terminal writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryRecordStore,
    failures_left: AtomicU32,
    terminal_attempts: AtomicU32,
}

impl FlakyStore {
    pub fn fail_terminal_writes(&self, times: u32) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn terminal_attempts(&self) -> u32 {
        self.terminal_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn create(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        self.inner.create(record).await
    }

    async fn update(&self, record: &RemediationRecord) -> Result<(), StoreError> {
        if record.is_terminal() {
            self.terminal_attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
        }
        self.inner.update(record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<RemediationRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn list_for_host(&self, host_id: &str) -> Result<Vec<RemediationRecord>, StoreError> {
        self.inner.list_for_host(host_id).await
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<NotifyEvent>>,
    hang_escalations: AtomicBool,
}

impl RecordingChannel {
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Escalations are recorded, then never answered.
    pub fn hang_on_escalation(&self) {
        self.hang_escalations.store(true, Ordering::SeqCst);
    }

    pub fn escalations(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, NotifyEvent::PersistenceEscalation { .. }))
            .count()
    }
}

#[async_trait]
impl NotifyChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        self.events.lock().unwrap().push(event.clone());
        if self.hang_escalations.load(Ordering::SeqCst)
            && matches!(event, NotifyEvent::PersistenceEscalation { .. })
        {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub alerts: Arc<FakeAlerts>,
    pub telemetry: Arc<FakeTelemetry>,
    pub transport: Arc<RecordingTransport>,
    pub diagnosis: Arc<FakeDiagnosis>,
    pub records: Arc<FlakyStore>,
    pub notifications: Arc<RecordingChannel>,
}

impl Harness {
    pub fn new(config: &RemediatorConfig) -> Self {
        Self::with_registry(config, RunbookRegistry::builtin().unwrap())
    }

    pub fn with_registry(config: &RemediatorConfig, registry: RunbookRegistry) -> Self {
        let alerts = Arc::new(FakeAlerts::default());
        let telemetry = Arc::new(FakeTelemetry::default());
        let transport = Arc::new(RecordingTransport::default());
        let diagnosis = Arc::new(FakeDiagnosis::default());
        let records = Arc::new(FlakyStore::default());
        let notifications = Arc::new(RecordingChannel::default());
        let channel: Arc<dyn NotifyChannel> = notifications.clone();

        let deps = Dependencies {
            alerts: alerts.clone(),
            diagnosis: Some(diagnosis.clone()),
            telemetry: telemetry.clone(),
            transport: transport.clone(),
            records: records.clone(),
            safety: Arc::new(InMemorySafetyStore::from_config(config)),
            notifier: Arc::new(Notifier::with_channels(vec![channel])),
        };
        let orchestrator =
            Arc::new(Orchestrator::new(config, Arc::new(registry), deps).unwrap());

        Self {
            orchestrator,
            alerts,
            telemetry,
            transport,
            diagnosis,
            records,
            notifications,
        }
    }

    /// Poll until `check` holds, failing the test after a few seconds.
    pub async fn wait_for(&self, mut check: impl FnMut(&Self) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check(self) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }
}
