//! HTTP surface: the admission endpoint plus health and metrics.
//!
//! `GET /webhook?sender=..&message=..` formats the chat line and puts it on
//! the delivery queue without waiting on the network. The response only
//! says whether the message was queued; delivery happens later.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::delivery::WorkerState;
use crate::destination::Destination;
use crate::event::{ChatEvent, Payload};
use crate::metrics::{format_uptime, Metrics};
use crate::queue::{EnqueueError, QueueSender};

/// Why a chat message was not queued.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Discord webhook not configured correctly.")]
    NotConfigured,

    #[error("Queue full! Message discarded.")]
    QueueFull,

    #[error("Delivery worker is not running. Message discarded.")]
    Closed,
}

impl AdmissionError {
    fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::NotConfigured => StatusCode::PRECONDITION_FAILED,
            AdmissionError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Body returned by `GET /webhook`.
#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    status: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl AdmissionResponse {
    fn queued() -> Self {
        Self {
            status: "queued",
            detail: None,
        }
    }

    fn error(detail: impl Into<String>) -> Self {
        Self {
            status: "error",
            detail: Some(detail.into()),
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(AdmissionResponse::error(self.to_string())),
        )
            .into_response()
    }
}

/// State shared by every request handler.
pub struct AppState {
    queue: QueueSender,
    destination: Destination,
    metrics: Arc<Metrics>,
    worker_state: watch::Receiver<WorkerState>,
}

impl AppState {
    pub fn new(
        queue: QueueSender,
        destination: Destination,
        metrics: Arc<Metrics>,
        worker_state: watch::Receiver<WorkerState>,
    ) -> Self {
        Self {
            queue,
            destination,
            metrics,
            worker_state,
        }
    }

    /// Validate, format and enqueue one chat message.
    ///
    /// Returns the payload id on success. Never waits on the queue or the
    /// network: a full queue is reported immediately.
    pub async fn admit(&self, event: &ChatEvent) -> Result<Uuid, AdmissionError> {
        self.metrics.record_received();

        // An invalid cached value gets one chance to be fixed from disk.
        if !self.destination.is_configured() && !self.reload_destination().await {
            self.metrics.record_rejected();
            error!("Discord webhook not configured correctly.");
            return Err(AdmissionError::NotConfigured);
        }

        let payload = Payload::from_event(event);
        let id = payload.id();

        match self.queue.enqueue(payload) {
            Ok(()) => {
                self.metrics.record_queued();
                debug!(
                    payload_id = %id,
                    sender = %event.sender,
                    queue_depth = self.queue.len(),
                    "Message queued"
                );
                Ok(id)
            }
            Err(EnqueueError::Full(_)) => {
                self.metrics.record_dropped();
                error!(
                    sender = %event.sender,
                    capacity = self.queue.capacity(),
                    "Queue full! Message discarded."
                );
                Err(AdmissionError::QueueFull)
            }
            Err(EnqueueError::Closed(_)) => {
                self.metrics.record_dropped();
                warn!(sender = %event.sender, "Delivery queue closed, message discarded");
                Err(AdmissionError::Closed)
            }
        }
    }

    /// Re-read the destination file on the blocking pool.
    async fn reload_destination(&self) -> bool {
        let destination = self.destination.clone();
        match tokio::task::spawn_blocking(move || destination.reload()).await {
            Ok(configured) => configured,
            Err(e) => {
                error!(error = %e, "Destination reload task failed");
                false
            }
        }
    }

    /// Worker state, or `Stopped` once the worker task is gone.
    fn worker_state(&self) -> WorkerState {
        if self.worker_state.has_changed().is_err() {
            return WorkerState::Stopped;
        }
        *self.worker_state.borrow()
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", get(forward_message))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

async fn forward_message(
    State(state): State<Arc<AppState>>,
    Query(event): Query<ChatEvent>,
) -> Result<Json<AdmissionResponse>, AdmissionError> {
    state.admit(&event).await?;
    Ok(Json(AdmissionResponse::queued()))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let worker = state.worker_state();

    Json(json!({
        "status": "ok",
        "worker": worker,
        "destination_configured": state.destination.is_configured(),
        "queue_depth": state.queue.len(),
    }))
}

/// Get metrics endpoint - returns relay counters as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": format_uptime(uptime),
        "queue": {
            "depth": state.queue.len(),
            "capacity": state.queue.capacity(),
        },
        "messages": state.metrics.snapshot(),
        "status": "running"
    }))
}
