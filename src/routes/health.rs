//! Health and metrics endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::health::BackendStatus;
use crate::metrics;
use crate::state::AppState;

/// GET /health
///
/// Liveness plus a per-service summary derived from circuit state.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.dispatcher.health();
    let services: serde_json::Map<String, serde_json::Value> = report
        .backends
        .iter()
        .map(|b| {
            (
                b.backend_id.clone(),
                json!({
                    "status": b.status,
                    "response_time": b.response_time_ms,
                }),
            )
        })
        .collect();

    let code = match report.overall() {
        "unhealthy" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (
        code,
        Json(json!({
            "status": report.overall(),
            "services": services,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

/// GET /health/comprehensive
///
/// Everything: per-backend health, queue depths, cache statistics.
pub async fn comprehensive(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.dispatcher.health();
    Json(json!({
        "status": report.overall(),
        "backends": report.backends,
        "queue": {
            "jobs_queued": report.jobs_queued,
            "jobs_running": report.jobs_running,
            "pending": report.pending,
            "batcher_depth": report.batcher_depth,
        },
        "cache": report.cache,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health/ready
///
/// Ready when at least one backend is routable.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.dispatcher.health();
    let routable = report
        .backends
        .iter()
        .any(|b| b.status != BackendStatus::Unhealthy);
    if routable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health/live
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /metrics
///
/// Prometheus text exposition.
pub async fn metrics() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}
