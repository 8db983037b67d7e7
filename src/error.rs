//! Error taxonomy for the gateway.
//!
//! Every failure carries a stable machine-readable `kind` plus a
//! human-readable message. Backend error details travel in a separate
//! `details` field and are never concatenated into the top-level message,
//! so callers scraping logs see stable text.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Stable error kinds, mapped to HTTP statuses at the northbound edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request validation failed.
    InvalidRequest,
    /// Admission queue is at capacity.
    Overloaded,
    /// Every eligible backend has an open circuit.
    NoBackendAvailable,
    /// Deadline elapsed somewhere along the dispatch path.
    Timeout,
    /// Connection-level failure before or during the backend call.
    Transport,
    /// Backend answered 4xx.
    UpstreamClient,
    /// Backend answered 5xx.
    UpstreamServer,
    /// Backend body could not be parsed.
    MalformedResponse,
    /// No free keep-alive slot within the deadline.
    PoolExhausted,
    /// Batched backend call returned fewer results than members.
    BatchShortResponse,
    /// Caller cancelled the job.
    Cancelled,
    /// Invariant violation inside the gateway.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::NoBackendAvailable => "no_backend_available",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::UpstreamClient => "upstream_client",
            ErrorKind::UpstreamServer => "upstream_server",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::BatchShortResponse => "batch_short_response",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds the dispatcher recovers from locally by retrying on another
    /// backend. Everything else surfaces immediately.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::UpstreamServer
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NoBackendAvailable | ErrorKind::PoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Transport
            | ErrorKind::UpstreamClient
            | ErrorKind::UpstreamServer
            | ErrorKind::MalformedResponse
            | ErrorKind::BatchShortResponse => StatusCode::BAD_GATEWAY,
            // Closest standard status to nginx's 499 client-closed-request.
            ErrorKind::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gateway error: stable kind, human message, optional backend detail.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    kind: ErrorKind,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn overloaded() -> Self {
        Self::new(ErrorKind::Overloaded, "pending queue is at capacity")
    }

    pub fn no_backend(capability: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::NoBackendAvailable,
            format!("no routable backend for capability {capability}"),
        )
    }

    pub fn timeout(context: &str) -> Self {
        Self::new(ErrorKind::Timeout, format!("deadline elapsed during {context}"))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "job cancelled by caller")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        let mut body = json!({
            "error": {
                "kind": self.kind.as_str(),
                "message": self.message,
            }
        });
        if let Some(details) = self.details {
            body["error"]["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::InvalidRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Overloaded.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::NoBackendAvailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorKind::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorKind::UpstreamServer.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorKind::Cancelled.status_code().as_u16(), 499);
    }

    #[test]
    fn test_retryable_set() {
        assert!(ErrorKind::Timeout.retryable());
        assert!(ErrorKind::Transport.retryable());
        assert!(ErrorKind::UpstreamServer.retryable());
        assert!(!ErrorKind::UpstreamClient.retryable());
        assert!(!ErrorKind::Cancelled.retryable());
        assert!(!ErrorKind::Overloaded.retryable());
    }

    #[test]
    fn test_details_stay_out_of_message() {
        let err = GatewayError::new(ErrorKind::UpstreamServer, "backend call failed")
            .with_details(json!({"status": 503, "body": "upstream exploded"}));
        assert_eq!(err.message(), "backend call failed");
        assert!(err.details().is_some());
    }
}
