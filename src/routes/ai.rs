//! Capability submission endpoints.
//!
//! Each endpoint submits a job and waits up to the configured
//! wait-for-result window. Jobs settling within the window answer with
//! the result inline; slower jobs answer `queued`/`running` with a job id
//! the caller polls.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::GatewayError;
use crate::state::AppState;
use crate::types::{Capability, Priority, SubmitOptions, SubmitResponse};

/// Per-request submission knobs, passed as query parameters so request
/// bodies stay identical to what the backend receives.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    pub allow_cache: Option<bool>,
    pub priority: Option<Priority>,
    pub timeout_seconds: Option<u64>,
}

/// POST /ai/llm/completion
pub async fn llm_completion(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    submit_and_wait(state, Capability::LlmCompletion, query, body).await
}

/// POST /ai/llm/chat
pub async fn llm_chat(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    submit_and_wait(state, Capability::LlmChat, query, body).await
}

/// POST /ai/vision/analyze
pub async fn vision_analyze(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    submit_and_wait(state, Capability::VisionAnalyze, query, body).await
}

/// POST /ai/nlp/process
pub async fn nlp_process(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    submit_and_wait(state, Capability::NlpAnalyze, query, body).await
}

/// POST /data/process
pub async fn data_process(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    submit_and_wait(state, Capability::DataProcess, query, body).await
}

async fn submit_and_wait(
    state: Arc<AppState>,
    capability: Capability,
    query: SubmitQuery,
    body: Value,
) -> Result<Response, GatewayError> {
    let options = SubmitOptions {
        deadline: query
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(state.config.http_timeout),
        allow_cache: query.allow_cache.unwrap_or(true),
        priority: query.priority.unwrap_or_default(),
    };

    let mut handle = state.dispatcher.submit(capability, body, options)?;
    info!(job_id = %handle.id(), capability = %capability, "request submitted");

    let snapshot = match tokio::time::timeout(state.config.wait_for_result, handle.wait()).await
    {
        Ok(terminal) => terminal,
        Err(_) => handle.snapshot(),
    };

    let envelope = SubmitResponse::from_snapshot(&snapshot);
    if envelope.is_failure() {
        // Terminal failures answer with the error kind's HTTP status but
        // keep the full envelope so the caller still gets the job id.
        let status = snapshot
            .error
            .as_ref()
            .map(|e| e.kind().status_code())
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
        return Ok((status, Json(envelope)).into_response());
    }
    Ok(Json(envelope).into_response())
}
