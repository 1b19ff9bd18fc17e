//! Error types for the remediation engine.

use thiserror::Error;
use uuid::Uuid;

use crate::source::SourceError;
use crate::store::StoreError;
use crate::types::{RemediationRecord, RemediationStatus};

/// An attempted status change that the record's state machine forbids.
#[derive(Debug, Clone, Error)]
#[error("record {record_id}: invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub record_id: Uuid,
    pub from: RemediationStatus,
    pub to: RemediationStatus,
}

/// Errors surfaced by the orchestrator to its callers.
///
/// Diagnosis, matching and safety failures never appear here: they are
/// recorded on the remediation record as blocked outcomes.
#[derive(Debug, Error)]
pub enum RemediationError {
    /// A non-terminal record already exists for this alert
    #[error("alert {alert_id} already has an active remediation ({record_id})")]
    AlreadyInFlight { alert_id: String, record_id: String },

    /// No record with this id
    #[error("remediation record {0} not found")]
    RecordNotFound(Uuid),

    /// Approval arrived for a record that is not waiting for one
    #[error("record {record_id} is not awaiting approval (status: {status})")]
    InvalidApproval {
        record_id: Uuid,
        status: RemediationStatus,
    },

    /// Alert referenced by a manual trigger does not exist
    #[error("alert {0} not found")]
    AlertNotFound(String),

    /// State machine violation
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A terminal outcome could not be made durable; operator attention required
    #[error("failed to persist terminal outcome for {record_id} after {attempts} attempts: {source}")]
    PersistenceExhausted {
        record_id: Uuid,
        attempts: u32,
        #[source]
        source: StoreError,
        /// The outcome that never landed
        record: Box<RemediationRecord>,
    },

    /// Record store failure outside of a terminal write
    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    /// Alert/host read failure
    #[error("alert source error: {0}")]
    Source(#[from] SourceError),
}

impl RemediationError {
    /// Fatal errors need an operator; everything else is per-request.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PersistenceExhausted { .. })
    }
}
