//! Per-backend HTTP clients with bounded keep-alive connections.
//!
//! One `reqwest` client per backend, configured with the pool limits from
//! configuration, plus a slot semaphore bounding concurrent outbound
//! calls. The pool never retries: retry policy lives in the dispatcher so
//! it can coordinate with admission and job state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::registry::Backend;
use crate::types::Capability;

/// Cap on how long a health probe may take, regardless of the configured
/// call timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct BackendClient {
    client: reqwest::Client,
    slots: Arc<Semaphore>,
}

/// Keep-alive HTTP clients for every registered backend.
pub struct BackendPool {
    clients: HashMap<String, BackendClient>,
}

impl BackendPool {
    /// Build one pooled client per backend.
    pub fn new(backends: &[Arc<Backend>], config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut clients = HashMap::new();
        for backend in backends {
            let client = reqwest::Client::builder()
                .pool_max_idle_per_host(config.http_pool_connections)
                .pool_idle_timeout(Duration::from_secs(30))
                .connect_timeout(config.http_connect_timeout)
                .timeout(config.http_timeout)
                .build()
                .map_err(|e| GatewayError::internal(format!("http client build: {e}")))?;
            clients.insert(
                backend.id.clone(),
                BackendClient {
                    client,
                    slots: Arc::new(Semaphore::new(config.http_pool_maxsize)),
                },
            );
        }
        Ok(Self { clients })
    }

    fn client_for(&self, backend: &Backend) -> Result<&BackendClient, GatewayError> {
        self.clients
            .get(&backend.id)
            .ok_or_else(|| GatewayError::internal(format!("no pooled client for {}", backend.id)))
    }

    /// POST one request body to the backend's capability endpoint.
    pub async fn call(
        &self,
        backend: &Arc<Backend>,
        capability: Capability,
        body: &Value,
        deadline: Instant,
    ) -> Result<Value, GatewayError> {
        let response = self.dispatch(backend, capability, body, deadline).await?;
        Ok(response)
    }

    /// POST an array of request bodies in one backend call. The backend
    /// answers with an array of results in the same order; the caller is
    /// responsible for length checks.
    pub async fn call_batch(
        &self,
        backend: &Arc<Backend>,
        capability: Capability,
        bodies: &[Value],
        deadline: Instant,
    ) -> Result<Vec<Value>, GatewayError> {
        let body = Value::Array(bodies.to_vec());
        let response = self.dispatch(backend, capability, &body, deadline).await?;
        match response {
            Value::Array(results) => Ok(results),
            other => Err(GatewayError::new(
                ErrorKind::MalformedResponse,
                "backend returned a non-array body for a batched call",
            )
            .with_details(serde_json::json!({"body": other}))),
        }
    }

    async fn dispatch(
        &self,
        backend: &Arc<Backend>,
        capability: Capability,
        body: &Value,
        deadline: Instant,
    ) -> Result<Value, GatewayError> {
        let entry = self.client_for(backend)?;
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| GatewayError::timeout("connection acquisition"))?;

        // Fast path when a slot is free; otherwise wait out the deadline.
        let _slot = match entry.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => tokio::time::timeout(remaining, entry.slots.clone().acquire_owned())
                .await
                .map_err(|_| {
                    GatewayError::new(
                        ErrorKind::PoolExhausted,
                        format!("no free connection slot for backend {}", backend.id),
                    )
                })?
                .map_err(|_| GatewayError::internal("connection pool closed"))?,
        };

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| GatewayError::timeout("backend call"))?;
        let url = format!("{}{}", backend.base_url, capability.endpoint());
        debug!(backend = %backend.id, url = %url, "dispatching backend call");

        let _in_flight = backend.begin_call();
        let response = tokio::time::timeout(
            remaining,
            entry.client.post(&url).json(body).send(),
        )
        .await
        .map_err(|_| GatewayError::timeout("backend call"))?
        .map_err(classify_send_error)?;

        let status = response.status();
        if status.is_server_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::new(
                ErrorKind::UpstreamServer,
                "backend returned a server error",
            )
            .with_details(serde_json::json!({"status": status.as_u16(), "body": detail})));
        }
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::new(
                ErrorKind::UpstreamClient,
                "backend rejected the request",
            )
            .with_details(serde_json::json!({"status": status.as_u16(), "body": detail})));
        }

        response.json::<Value>().await.map_err(|e| {
            GatewayError::new(ErrorKind::MalformedResponse, "backend body is not valid JSON")
                .with_details(serde_json::json!({"error": e.to_string()}))
        })
    }

    /// Cheap liveness request used by the health monitor.
    pub async fn probe(&self, backend: &Arc<Backend>) -> Result<Duration, GatewayError> {
        let entry = self.client_for(backend)?;
        let url = format!("{}/health", backend.base_url);
        let started = Instant::now();
        let response = tokio::time::timeout(PROBE_TIMEOUT, entry.client.get(&url).send())
            .await
            .map_err(|_| GatewayError::timeout("health probe"))?
            .map_err(classify_send_error)?;
        if !response.status().is_success() {
            return Err(GatewayError::new(
                ErrorKind::UpstreamServer,
                "health probe returned a non-success status",
            )
            .with_details(serde_json::json!({"status": response.status().as_u16()})));
        }
        Ok(started.elapsed())
    }

    /// Free slots on one backend's pool, for the admin surface.
    pub fn available_slots(&self, backend_id: &str) -> Option<usize> {
        self.clients.get(backend_id).map(|c| c.slots.available_permits())
    }
}

fn classify_send_error(e: reqwest::Error) -> GatewayError {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Transport
    };
    let message = match kind {
        ErrorKind::Timeout => "backend call timed out",
        _ => "backend connection failed",
    };
    GatewayError::new(kind, message)
        .with_details(serde_json::json!({"error": e.to_string()}))
}

/// Map an HTTP status onto the error kind used for dispatch-path
/// classification. Exposed for tests.
pub fn kind_for_status(status: StatusCode) -> Option<ErrorKind> {
    if status.is_server_error() {
        Some(ErrorKind::UpstreamServer)
    } else if status.is_client_error() {
        Some(ErrorKind::UpstreamClient)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_status() {
        assert_eq!(kind_for_status(StatusCode::BAD_GATEWAY), Some(ErrorKind::UpstreamServer));
        assert_eq!(kind_for_status(StatusCode::NOT_FOUND), Some(ErrorKind::UpstreamClient));
        assert_eq!(kind_for_status(StatusCode::OK), None);
    }

    #[tokio::test]
    async fn test_call_times_out_against_unroutable_address() {
        let config = GatewayConfig {
            http_connect_timeout: Duration::from_millis(50),
            http_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        // TEST-NET-1 address: connections hang or fail fast, never succeed.
        let backend = crate::registry::BackendRegistry::make_backend(
            "dead",
            "http://192.0.2.1:9".to_string(),
            vec![Capability::NlpAnalyze],
            false,
            &config,
        );
        let pool = BackendPool::new(std::slice::from_ref(&backend), &config).unwrap();
        let deadline = Instant::now() + Duration::from_millis(200);
        let err = pool
            .call(&backend, Capability::NlpAnalyze, &serde_json::json!({}), deadline)
            .await
            .unwrap_err();
        assert!(
            matches!(err.kind(), ErrorKind::Timeout | ErrorKind::Transport),
            "unexpected kind: {:?}",
            err.kind()
        );
        // The in-flight guard unwound.
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_immediately() {
        let config = GatewayConfig::default();
        let backend = crate::registry::BackendRegistry::make_backend(
            "b",
            "http://127.0.0.1:1".to_string(),
            vec![Capability::NlpAnalyze],
            false,
            &config,
        );
        let pool = BackendPool::new(std::slice::from_ref(&backend), &config).unwrap();
        let deadline = Instant::now() - Duration::from_millis(1);
        let err = pool
            .call(&backend, Capability::NlpAnalyze, &serde_json::json!({}), deadline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
