//! HTTP surface of the ingest service.
//!
//! | Route          | Purpose                                    |
//! |----------------|--------------------------------------------|
//! | `POST /ingest` | validate and append one telemetry event    |
//! | `GET /health`  | broker reachability                        |
//! | `GET /metrics` | Prometheus text, or a JSON summary         |
//!
//! When an API key is configured, `/ingest` requires `Authorization: Bearer <key>`.

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::metrics::Status;
use crate::producer::{IngestError, Producer};
use crate::stream::Stream;

/// Shared state for the ingest handlers.
pub struct AppState {
    pub producer: Producer,
    pub metrics_handle: Option<PrometheusHandle>,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(producer: Producer) -> Self {
        Self {
            producer,
            metrics_handle: None,
            api_key: None,
        }
    }

    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }
}

/// Build the ingest router.
pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/ingest", post(ingest))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(api_key) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if token == api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn ingest(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let start = Instant::now();

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "Request body is not JSON");
            state
                .producer
                .metrics()
                .record_ingest(Status::Error, start.elapsed());
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "status": "rejected",
                    "error": "malformed_json",
                    "detail": e.to_string(),
                })),
            )
                .into_response();
        }
    };

    match state.producer.ingest(&raw).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "id": receipt.device_id })),
        )
            .into_response(),
        Err(IngestError::Validation(e)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "status": "rejected",
                "error": e.kind(),
                "field": e.field(),
                "detail": e.to_string(),
            })),
        )
            .into_response(),
        Err(IngestError::Broker(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "error": "broker_unavailable",
                "detail": e.to_string(),
            })),
        )
            .into_response(),
        Err(e @ IngestError::Encode(_)) => {
            error!(error = %e, "Failed to encode accepted event");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": "internal" })),
            )
                .into_response()
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.producer.stream().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "broker": "connected" })),
        ),
        Err(e) => {
            error!(error = %e, "Broker health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "broker": "disconnected" })),
            )
        }
    }
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Response {
    if let Some(handle) = &state.metrics_handle {
        return (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response();
    }

    let metrics = state.producer.metrics();
    let stats = metrics.snapshot();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": metrics.uptime().as_secs(),
        "ingested": {
            "success": stats.ingested_success,
            "error": stats.ingested_error,
        },
    }))
    .into_response()
}
