//! Alert event dispatch.
//!
//! Fired alerts go through a bounded queue; a single loop drains it and
//! spawns one task per request, never more than `max_concurrent` at once.
//! When every worker is busy the loop stops draining, the queue fills, and
//! `try_submit` reports `QueueFull` to the caller instead of buffering
//! without bound. Resolution and acknowledgment events skip the queue.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RemediationError;
use crate::orchestrator::Orchestrator;
use crate::types::{AlertEvent, AlertEventKind, RemediationRecord, RemediationRequest};

/// Dispatch errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("remediation queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("remediation queue is closed")]
    Closed,
}

/// What happened to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Queued,
    /// In-flight work for the alert was signalled to stop
    Cancelled,
    /// Nothing was running for the alert
    Ignored,
}

/// Consumer of dispatched requests.
#[async_trait]
pub trait RemediationHandler: Send + Sync + 'static {
    async fn handle(&self, request: RemediationRequest)
        -> Result<RemediationRecord, RemediationError>;

    /// Signal in-flight work for the alert to stop.
    fn cancel(&self, alert_id: &str) -> bool;
}

#[async_trait]
impl RemediationHandler for Orchestrator {
    async fn handle(
        &self,
        request: RemediationRequest,
    ) -> Result<RemediationRecord, RemediationError> {
        Orchestrator::handle(self, request).await
    }

    fn cancel(&self, alert_id: &str) -> bool {
        Orchestrator::cancel(self, alert_id)
    }
}

/// Front door for alert events.
pub struct Dispatcher {
    sender: mpsc::Sender<RemediationRequest>,
    handler: Arc<dyn RemediationHandler>,
    capacity: usize,
}

impl Dispatcher {
    /// Start the queue loop. It stops when `shutdown` fires, after waiting
    /// for running remediations to finish.
    pub fn start(
        handler: Arc<dyn RemediationHandler>,
        capacity: usize,
        max_concurrent: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let worker = tokio::spawn(run_queue(
            Arc::clone(&handler),
            receiver,
            Arc::new(Semaphore::new(max_concurrent)),
            shutdown,
        ));
        (
            Self {
                sender,
                handler,
                capacity,
            },
            worker,
        )
    }

    /// Enqueue without waiting.
    pub fn try_submit(&self, request: RemediationRequest) -> Result<(), DispatchError> {
        self.sender.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(request) => {
                warn!(alert_id = %request.alert_id, capacity = self.capacity, "Remediation queue full");
                DispatchError::QueueFull {
                    capacity: self.capacity,
                }
            }
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Route one event from the alert feed.
    pub fn handle_event(&self, event: &AlertEvent) -> Result<EventDisposition, DispatchError> {
        match event.kind {
            AlertEventKind::Fired => {
                debug!(alert_id = %event.alert_id, host = %event.host_id, metric = %event.metric, "Alert fired");
                self.try_submit(RemediationRequest::from(event))?;
                Ok(EventDisposition::Queued)
            }
            AlertEventKind::Resolved | AlertEventKind::Acknowledged => {
                if self.handler.cancel(&event.alert_id) {
                    Ok(EventDisposition::Cancelled)
                } else {
                    Ok(EventDisposition::Ignored)
                }
            }
        }
    }
}

async fn run_queue(
    handler: Arc<dyn RemediationHandler>,
    mut receiver: mpsc::Receiver<RemediationRequest>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let mut tasks = JoinSet::new();

    loop {
        let request = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            request = receiver.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let handler = Arc::clone(&handler);
        tasks.spawn(async move {
            let _permit = permit;
            let alert_id = request.alert_id.clone();
            match handler.handle(request).await {
                Ok(record) => debug!(alert_id, record_id = %record.id, status = %record.status, "Remediation task done"),
                Err(e @ RemediationError::AlreadyInFlight { .. }) => info!(alert_id, "{e}"),
                Err(e) if e.is_fatal() => error!(alert_id, error = %e, "Remediation task failed fatally"),
                Err(e) => warn!(alert_id, error = %e, "Remediation task failed"),
            }
        });

        while tasks.try_join_next().is_some() {}
    }

    info!(running = tasks.len(), "Dispatcher stopping, waiting for running remediations");
    while tasks.join_next().await.is_some() {}
}
