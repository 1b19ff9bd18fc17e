//! HTTP server for the remediation engine.
//!
//! Provides REST API endpoints for:
//! - Health checks
//! - Receiving alert events from the monitoring system
//! - Operator actions (manual trigger, approval)
//! - Querying remediation records and the runbook catalog

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::dispatch::{DispatchError, Dispatcher, EventDisposition};
use crate::error::RemediationError;
use crate::orchestrator::Orchestrator;
use crate::registry::RunbookDefinition;
use crate::types::AlertEvent;

/// Server state shared across handlers.
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub dispatcher: Dispatcher,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/events", post(event_handler))
        .route("/api/remediations", post(manual_handler))
        .route("/api/remediations/{id}", get(record_handler))
        .route("/api/remediations/{id}/approve", post(approve_handler))
        .route("/api/hosts/{host_id}/remediations", get(host_history_handler))
        .route("/api/approvals", get(approvals_handler))
        .route("/api/runbooks", get(runbooks_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server; returns once `shutdown` completes.
///
/// # Errors
///
/// Returns an error if the server fails to bind or serve.
pub async fn run_server(
    state: Arc<ServerState>,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Remediation server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    dry_run: bool,
}

/// Operator request to remediate an alert.
#[derive(Debug, Deserialize)]
pub struct ManualRequest {
    pub alert_id: String,
    pub user_id: String,
}

/// Operator sign-off for a CONFIRM runbook.
#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    status: &'static str,
    alert_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Error rendered as a JSON body with a matching status code.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<RemediationError> for ApiError {
    fn from(e: RemediationError) -> Self {
        let status = match &e {
            RemediationError::AlreadyInFlight { .. } | RemediationError::InvalidApproval { .. } => {
                StatusCode::CONFLICT
            }
            RemediationError::RecordNotFound(_) | RemediationError::AlertNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RemediationError::Source(_) => StatusCode::BAD_GATEWAY,
            _ => {
                error!(error = %e, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self(status, e.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        dry_run: state.orchestrator.dry_run(),
    })
}

/// Alert feed entry point.
async fn event_handler(
    State(state): State<Arc<ServerState>>,
    Json(event): Json<AlertEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let disposition = state.dispatcher.handle_event(&event)?;
    let (status, label) = match disposition {
        EventDisposition::Queued => (StatusCode::ACCEPTED, "queued"),
        EventDisposition::Cancelled => (StatusCode::OK, "cancelled"),
        EventDisposition::Ignored => (StatusCode::OK, "ignored"),
    };
    Ok((
        status,
        Json(AcceptedResponse {
            status: label,
            alert_id: event.alert_id,
        }),
    ))
}

/// Manual trigger. Queued like a fired alert; poll the host history for the record.
async fn manual_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ManualRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(record_id) = state.orchestrator.in_flight(&body.alert_id) {
        return Err(RemediationError::AlreadyInFlight {
            alert_id: body.alert_id,
            record_id: record_id.to_string(),
        }
        .into());
    }

    let request = state
        .orchestrator
        .manual_request(&body.alert_id, &body.user_id)
        .await?;
    state.dispatcher.try_submit(request)?;
    info!(alert_id = %body.alert_id, user_id = %body.user_id, "Manual remediation queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            alert_id: body.alert_id,
        }),
    ))
}

async fn record_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .orchestrator
        .get(id)
        .await?
        .ok_or(RemediationError::RecordNotFound(id))?;
    Ok(Json(record))
}

async fn host_history_handler(
    State(state): State<Arc<ServerState>>,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.list_for_host(&host_id).await?))
}

async fn approve_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.approve(id, &body.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn approvals_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.orchestrator.awaiting_approval())
}

async fn runbooks_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let runbooks: Vec<&RunbookDefinition> = state
        .orchestrator
        .registry()
        .iter()
        .map(|runbook| &**runbook)
        .collect();
    Json(serde_json::to_value(runbooks).unwrap_or_default())
}
