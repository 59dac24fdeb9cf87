//! HTTP ingestion endpoint: `POST /mail` publishes an event to the inbound topic

use crate::models::MailEvent;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use stream_worker::{DeliveryRecord, QueueClient, QueueError};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const CODE_INVALID_PAYLOAD: i32 = 1003;
pub const CODE_QUEUE_UNAVAILABLE: i32 = 1011;

/// Shared state for the ingestion router
#[derive(Clone)]
pub struct IngestState {
    pub queue: Arc<dyn QueueClient>,
    pub topic: String,
}

impl IngestState {
    pub fn new(queue: Arc<dyn QueueClient>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            topic: topic.into(),
        }
    }
}

/// Error body returned by the ingestion endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: i32,
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, code, error) = match &self {
            IngestError::InvalidPayload(e) => {
                warn!(error_code = CODE_INVALID_PAYLOAD, error = %e, "Rejected mail payload");
                (StatusCode::BAD_REQUEST, CODE_INVALID_PAYLOAD, "INVALID_PAYLOAD")
            }
            IngestError::QueueUnavailable(e) => {
                error!(error_code = CODE_QUEUE_UNAVAILABLE, error = %e, "Failed to publish mail");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    CODE_QUEUE_UNAVAILABLE,
                    "QUEUE_UNAVAILABLE",
                )
            }
        };

        let body = ErrorResponse {
            code,
            error,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Accept a mail event and publish it under a fresh key
pub async fn accept_mail(
    State(state): State<IngestState>,
    body: Bytes,
) -> Result<StatusCode, IngestError> {
    let event = MailEvent::decode(&body)?;
    let record = DeliveryRecord::new(Uuid::new_v4().to_string(), event.encode()?);

    let ack = state.queue.publish(&state.topic, &record).await?;
    debug!(
        key = %record.key,
        topic = %ack.topic,
        partition = ack.partition,
        offset = %ack.offset,
        trace_id = event.trace_id.as_deref().unwrap_or_default(),
        "Mail queued"
    );

    Ok(StatusCode::NO_CONTENT)
}

pub fn router(state: IngestState) -> Router {
    Router::new()
        .route("/mail", post(accept_mail))
        .with_state(state)
}
