//! Circuit breaker and rate limiter state.
//!
//! All reads and writes for one host go through a single lock so two
//! concurrent attempts can never both observe a closed breaker or a free
//! rate-limit slot. The trait keeps the state externalizable: a shared
//! key-value store can implement it for multi-instance deployments.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

/// Per-host breaker state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub opened_until: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    #[must_use]
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.opened_until.is_some_and(|until| now < until)
    }
}

/// Per-host, per-runbook fixed-window counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterState {
    pub window_start: DateTime<Utc>,
    pub count_in_window: u32,
}

impl RateLimiterState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            count_in_window: 0,
        }
    }
}

/// Breaker policy.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

/// Rate limiter window.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub window: Duration,
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("safety state unavailable: {0}")]
    Unavailable(String),
}

/// Store for breaker and rate-limiter state.
#[async_trait]
pub trait SafetyStateStore: Send + Sync {
    /// Current breaker state. An expired breaker is reset to closed here.
    async fn circuit(&self, host_id: &str, now: DateTime<Utc>)
        -> Result<CircuitBreakerState, StateError>;

    /// Current window for (host, runbook). An elapsed window starts over.
    async fn rate(
        &self,
        host_id: &str,
        runbook_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimiterState, StateError>;

    /// Count one execution attempt.
    async fn record_attempt(
        &self,
        host_id: &str,
        runbook_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimiterState, StateError>;

    /// Apply a terminal execution outcome to the host's breaker.
    async fn record_outcome(
        &self,
        host_id: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerState, StateError>;
}

#[derive(Debug, Default)]
struct HostSafety {
    circuit: CircuitBreakerState,
    rates: HashMap<String, RateLimiterState>,
}

impl HostSafety {
    fn circuit_at(&mut self, now: DateTime<Utc>) -> &CircuitBreakerState {
        if self.circuit.opened_until.is_some_and(|until| now >= until) {
            self.circuit = CircuitBreakerState::default();
        }
        &self.circuit
    }

    fn rate_at(
        &mut self,
        runbook_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> &mut RateLimiterState {
        let state = self
            .rates
            .entry(runbook_id.to_string())
            .or_insert_with(|| RateLimiterState::fresh(now));
        if now - state.window_start >= window {
            *state = RateLimiterState::fresh(now);
        }
        state
    }
}

/// In-process store for single-instance deployments.
pub struct InMemorySafetyStore {
    circuit: CircuitPolicy,
    rate: RateWindow,
    hosts: Mutex<HashMap<String, HostSafety>>,
}

impl InMemorySafetyStore {
    #[must_use]
    pub fn new(circuit: CircuitPolicy, rate: RateWindow) -> Self {
        Self {
            circuit,
            rate,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Policies from the `circuit` and `safety` configuration sections.
    #[must_use]
    pub fn from_config(config: &crate::config::RemediatorConfig) -> Self {
        Self::new(
            CircuitPolicy {
                failure_threshold: config.circuit.failure_threshold,
                cooldown: Duration::seconds(config.circuit.cooldown_secs as i64),
            },
            RateWindow {
                window: Duration::seconds(config.safety.rate_limit_window_secs as i64),
            },
        )
    }

    fn with_host<T>(&self, host_id: &str, f: impl FnOnce(&mut HostSafety) -> T) -> T {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        f(hosts.entry(host_id.to_string()).or_default())
    }
}

#[async_trait]
impl SafetyStateStore for InMemorySafetyStore {
    async fn circuit(
        &self,
        host_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerState, StateError> {
        Ok(self.with_host(host_id, |host| host.circuit_at(now).clone()))
    }

    async fn rate(
        &self,
        host_id: &str,
        runbook_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimiterState, StateError> {
        let window = self.rate.window;
        Ok(self.with_host(host_id, |host| host.rate_at(runbook_id, window, now).clone()))
    }

    async fn record_attempt(
        &self,
        host_id: &str,
        runbook_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimiterState, StateError> {
        let window = self.rate.window;
        Ok(self.with_host(host_id, |host| {
            let state = host.rate_at(runbook_id, window, now);
            state.count_in_window += 1;
            state.clone()
        }))
    }

    async fn record_outcome(
        &self,
        host_id: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerState, StateError> {
        let policy = self.circuit;
        Ok(self.with_host(host_id, |host| {
            host.circuit_at(now);
            if success {
                if host.circuit.consecutive_failures > 0 {
                    info!(host = host_id, "Circuit breaker reset after success");
                }
                host.circuit = CircuitBreakerState::default();
            } else {
                host.circuit.consecutive_failures += 1;
                if host.circuit.consecutive_failures >= policy.failure_threshold
                    && host.circuit.opened_until.is_none()
                {
                    let until = now + policy.cooldown;
                    warn!(
                        host = host_id,
                        failures = host.circuit.consecutive_failures,
                        opened_until = %until,
                        "Circuit breaker opened"
                    );
                    host.circuit.opened_until = Some(until);
                }
            }
            host.circuit.clone()
        }))
    }
}
