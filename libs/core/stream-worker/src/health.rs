//! Health check handlers.
//!
//! - Liveness: `GET|HEAD /healthz` (204) and `GET /health` (JSON)
//! - Readiness: `GET /ready`, pings the queue
//! - Prometheus metrics: `GET /metrics`

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::queue::QueueClient;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub queue: Arc<dyn QueueClient>,
    pub metrics: Option<PrometheusHandle>,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            metrics: None,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

async fn healthz_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe: the queue must answer a ping.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    match state.queue.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "queue": "ok" }
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "queue": format!("error: {}", e) }
            })),
        ),
    }
}

/// Prometheus text format for scraping.
pub async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics exporter not installed".to_string(),
        )
            .into_response(),
    }
}

/// Router with the liveness, readiness and metrics endpoints.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
