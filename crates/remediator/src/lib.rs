//! Automated alert remediation.
//!
//! When a monitoring alert fires, the engine:
//! 1. Optionally asks a reasoning service for a structured diagnosis
//! 2. Selects a runbook from a fixed catalog (diagnosis first, rules second)
//! 3. Runs the selection through a safety gate (circuit breaker, risk level,
//!    command blacklist, rate limit, operator approval)
//! 4. Executes the runbook's commands on the affected host
//! 5. Re-reads the alerting metric to verify the fix
//!
//! Every attempt is recorded as a durable `RemediationRecord`.

pub mod config;
pub mod diagnosis;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod gate;
pub mod matcher;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod source;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod templates;
pub mod transport;
pub mod types;
pub mod verify;

pub use config::RemediatorConfig;
pub use dispatch::{DispatchError, Dispatcher, EventDisposition, RemediationHandler};
pub use error::{RemediationError, TransitionError};
pub use gate::{GateDecision, SafetyGate};
pub use orchestrator::{Dependencies, Orchestrator};
pub use registry::{RunbookDefinition, RunbookRegistry};
pub use types::{
    Alert, AlertEvent, AlertEventKind, BlockReason, FailureReason, Host, RemediationRecord,
    RemediationRequest, RemediationStatus, RiskLevel,
};
