//! Backend registry and capability routing.
//!
//! The backend set is static for the life of the process: one record per
//! sibling service, built from configuration at startup. Only health state
//! and the outstanding-call counters mutate afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::health::{BackendStatus, CircuitBreaker, HealthSnapshot};
use crate::metrics;
use crate::types::Capability;

/// One backend service: an opaque HTTP endpoint with a declared
/// capability set.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub base_url: String,
    pub capabilities: Vec<Capability>,
    pub max_in_flight: usize,
    /// Whether the backend accepts an array body for batched calls.
    pub supports_batch: bool,
    pub breaker: CircuitBreaker,
    in_flight: AtomicUsize,
}

impl Backend {
    fn new(
        id: &str,
        base_url: String,
        capabilities: Vec<Capability>,
        supports_batch: bool,
        config: &GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            base_url,
            capabilities,
            max_in_flight: config.max_in_flight,
            supports_batch,
            breaker: CircuitBreaker::new(
                config.circuit_failure_threshold,
                config.circuit_cooldown,
            ),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn handles(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Mark one outbound call as started; the guard unwinds the counter
    /// and gauge on every exit path.
    pub fn begin_call(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        metrics::ACTIVE_CONNECTIONS
            .with_label_values(&[&self.id])
            .inc();
        InFlightGuard { backend: Arc::clone(self) }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            backend_id: self.id.clone(),
            status: self.breaker.status(),
            consecutive_failures: self.breaker.consecutive_failures(),
            last_probe_ago_ms: self.breaker.since_last_probe().map(|d| d.as_millis() as u64),
            response_time_ms: self
                .breaker
                .probe_latency()
                .map(|d| d.as_secs_f64() * 1000.0),
            open_for_ms: self.breaker.open_until().map(|d| d.as_millis() as u64),
            in_flight: self.in_flight(),
        }
    }
}

/// RAII marker for one outstanding call to a backend.
pub struct InFlightGuard {
    backend: Arc<Backend>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::AcqRel);
        metrics::ACTIVE_CONNECTIONS
            .with_label_values(&[&self.backend.id])
            .dec();
    }
}

/// Holds the backend set and answers capability→backend resolution.
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
    /// Round-robin cursors per capability, for tie-breaks.
    cursors: Mutex<HashMap<Capability, usize>>,
}

impl BackendRegistry {
    /// Build the registry from configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let backends = vec![
            Backend::new(
                "llm",
                config.llm_service_url.clone(),
                vec![Capability::LlmCompletion, Capability::LlmChat],
                true,
                config,
            ),
            Backend::new(
                "vision",
                config.vision_service_url.clone(),
                vec![Capability::VisionAnalyze],
                true,
                config,
            ),
            Backend::new(
                "nlp",
                config.nlp_service_url.clone(),
                vec![Capability::NlpAnalyze],
                true,
                config,
            ),
            Backend::new(
                "data",
                config.data_processor_url.clone(),
                vec![Capability::DataProcess],
                false,
                config,
            ),
        ];
        Self { backends, cursors: Mutex::new(HashMap::new()) }
    }

    /// Build a registry from explicit backends (tests, admin tooling).
    pub fn from_backends(backends: Vec<Arc<Backend>>) -> Self {
        Self { backends, cursors: Mutex::new(HashMap::new()) }
    }

    /// Construct a backend record compatible with this registry.
    pub fn make_backend(
        id: &str,
        base_url: String,
        capabilities: Vec<Capability>,
        supports_batch: bool,
        config: &GatewayConfig,
    ) -> Arc<Backend> {
        Backend::new(id, base_url, capabilities, supports_batch, config)
    }

    pub fn all(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// All backends declaring `capability`, regardless of health. Used by
    /// probes and the admin surface.
    pub fn backends_for(&self, capability: Capability) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.handles(capability))
            .cloned()
            .collect()
    }

    /// Pick a backend for new work.
    ///
    /// Ordering: Healthy before Degraded, then fewest outstanding calls,
    /// then round-robin among ties. `exclude` keeps a retry off the
    /// backend that just failed, unless it is the only one routable.
    /// Selection happens under one short lock so concurrent resolvers see
    /// consistent counters.
    pub fn resolve(
        &self,
        capability: Capability,
        exclude: Option<&str>,
    ) -> Result<Arc<Backend>, GatewayError> {
        let mut cursors = self.cursors.lock();

        let routable: Vec<&Arc<Backend>> = self
            .backends
            .iter()
            .filter(|b| b.handles(capability) && b.breaker.allows_traffic())
            .collect();
        if routable.is_empty() {
            return Err(GatewayError::no_backend(capability));
        }

        let mut candidates: Vec<&Arc<Backend>> = routable
            .iter()
            .copied()
            .filter(|b| Some(b.id.as_str()) != exclude)
            .collect();
        if candidates.is_empty() {
            // The excluded backend is the only one left; reuse it.
            candidates = routable;
        }

        let rank = |b: &Arc<Backend>| match b.breaker.status() {
            BackendStatus::Healthy => 0usize,
            BackendStatus::Degraded => 1,
            BackendStatus::Unhealthy => 2,
        };
        let best_key = candidates
            .iter()
            .map(|b| (rank(b), b.in_flight()))
            .min()
            .expect("candidates non-empty");
        let ties: Vec<&Arc<Backend>> = candidates
            .into_iter()
            .filter(|b| (rank(b), b.in_flight()) == best_key)
            .collect();

        let cursor = cursors.entry(capability).or_insert(0);
        let chosen = Arc::clone(ties[*cursor % ties.len()]);
        *cursor = cursor.wrapping_add(1);
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(n: usize) -> BackendRegistry {
        let config = GatewayConfig::default();
        let backends = (0..n)
            .map(|i| {
                Backend::new(
                    &format!("b{i}"),
                    format!("http://127.0.0.1:{}", 9000 + i),
                    vec![Capability::NlpAnalyze],
                    true,
                    &config,
                )
            })
            .collect();
        BackendRegistry::from_backends(backends)
    }

    #[test]
    fn test_resolve_unknown_capability() {
        let registry = test_registry(2);
        let err = registry.resolve(Capability::LlmChat, None).unwrap_err();
        assert_eq!(err.kind().as_str(), "no_backend_available");
    }

    #[test]
    fn test_round_robin_tie_break() {
        let registry = test_registry(2);
        let a = registry.resolve(Capability::NlpAnalyze, None).unwrap();
        let b = registry.resolve(Capability::NlpAnalyze, None).unwrap();
        assert_ne!(a.id, b.id, "equal-load backends alternate");
    }

    #[test]
    fn test_least_outstanding_wins() {
        let registry = test_registry(2);
        let busy = registry.backends_for(Capability::NlpAnalyze)[0].clone();
        let _guard = busy.begin_call();
        for _ in 0..4 {
            let picked = registry.resolve(Capability::NlpAnalyze, None).unwrap();
            assert_ne!(picked.id, busy.id);
        }
    }

    #[test]
    fn test_exclude_prefers_other_backend() {
        let registry = test_registry(2);
        for _ in 0..4 {
            let picked = registry.resolve(Capability::NlpAnalyze, Some("b0")).unwrap();
            assert_eq!(picked.id, "b1");
        }
    }

    #[test]
    fn test_exclude_falls_back_when_alone() {
        let registry = test_registry(1);
        let picked = registry.resolve(Capability::NlpAnalyze, Some("b0")).unwrap();
        assert_eq!(picked.id, "b0");
    }

    #[test]
    fn test_open_circuit_not_routed() {
        let registry = test_registry(2);
        let bad = registry.backends_for(Capability::NlpAnalyze)[0].clone();
        for _ in 0..GatewayConfig::default().circuit_failure_threshold {
            bad.breaker.record_failure();
        }
        for _ in 0..4 {
            let picked = registry.resolve(Capability::NlpAnalyze, None).unwrap();
            assert_ne!(picked.id, bad.id);
        }
    }

    #[test]
    fn test_all_circuits_open_fails() {
        let registry = test_registry(1);
        let only = registry.backends_for(Capability::NlpAnalyze)[0].clone();
        for _ in 0..GatewayConfig::default().circuit_failure_threshold {
            only.breaker.record_failure();
        }
        let err = registry.resolve(Capability::NlpAnalyze, None).unwrap_err();
        assert_eq!(err.kind().as_str(), "no_backend_available");
    }

    #[test]
    fn test_in_flight_guard_unwinds() {
        let registry = test_registry(1);
        let backend = registry.backends_for(Capability::NlpAnalyze)[0].clone();
        {
            let _g1 = backend.begin_call();
            let _g2 = backend.begin_call();
            assert_eq!(backend.in_flight(), 2);
        }
        assert_eq!(backend.in_flight(), 0);
    }
}
