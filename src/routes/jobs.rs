//! Job lookup, listing and cancellation.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::jobs::ListFilter;
use crate::state::AppState;
use crate::types::{parse_status, Capability, ListResponse};

const DEFAULT_LIST_LIMIT: usize = 50;

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.get(&id) {
        Some(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "kind": "not_found",
                    "message": format!("job {id} not found"),
                }
            })),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub capability: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /jobs?status=&capability=&limit=&offset=
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let filter = ListFilter {
        status: query.status.as_deref().and_then(parse_status),
        capability: query
            .capability
            .as_deref()
            .and_then(|s| s.parse::<Capability>().ok()),
        limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        offset: query.offset.unwrap_or(0),
        ..Default::default()
    };
    let (jobs, total) = state.dispatcher.list(&filter);
    Json(ListResponse { jobs, total, limit: filter.limit, offset: filter.offset })
}

/// DELETE /jobs/{id}
///
/// Cancels the job; repeating the call is a no-op on an already-terminal
/// job.
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.cancel(&id) {
        Some(snapshot) => {
            info!(job_id = %id, status = snapshot.status.status_label(), "cancel requested");
            (
                StatusCode::OK,
                Json(json!({
                    "job_id": snapshot.job_id,
                    "status": snapshot.status.status_label(),
                })),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "kind": "not_found",
                    "message": format!("job {id} not found"),
                }
            })),
        ),
    }
}
