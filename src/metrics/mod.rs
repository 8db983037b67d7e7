//! Prometheus metrics for the gateway.
//!
//! Metric names are part of the operational contract: dashboards and
//! alerts scrape them by name, so they stay stable.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global registry for gateway metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total submissions by capability and terminal status.
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total requests"),
        &["capability", "status"]
    ).expect("metric can be created");

    /// End-to-end request duration by capability.
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("request_duration_seconds", "Request duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["capability"]
    ).expect("metric can be created");

    /// Outstanding backend calls per backend.
    pub static ref ACTIVE_CONNECTIONS: GaugeVec = GaugeVec::new(
        Opts::new("active_connections", "Outstanding backend calls"),
        &["backend"]
    ).expect("metric can be created");

    /// Jobs currently queued (not yet admitted).
    pub static ref JOBS_QUEUED: Gauge = Gauge::with_opts(
        Opts::new("jobs_queued", "Jobs currently queued")
    ).expect("metric can be created");

    /// Jobs currently running a backend call.
    pub static ref JOBS_RUNNING: Gauge = Gauge::with_opts(
        Opts::new("jobs_running", "Jobs currently running")
    ).expect("metric can be created");

    /// Backend invocations by capability and outcome.
    pub static ref MODEL_INFERENCE_TOTAL: CounterVec = CounterVec::new(
        Opts::new("model_inference_total", "Backend inference calls"),
        &["capability", "status"]
    ).expect("metric can be created");

    /// Errors by capability and kind.
    pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("errors_total", "Errors by kind"),
        &["capability", "kind"]
    ).expect("metric can be created");

    /// Backend health: 1 healthy, 0.5 degraded, 0 unhealthy.
    pub static ref BACKEND_HEALTH: GaugeVec = GaugeVec::new(
        Opts::new("backend_health", "Backend health (1/0.5/0)"),
        &["backend"]
    ).expect("metric can be created");

    /// Cache hits and misses by outcome (hit, miss, joined).
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("cache_lookups_total", "Response cache lookups"),
        &["outcome"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry. Idempotent enough for
/// tests: duplicate registration errors are ignored.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(REQUESTS_TOTAL.clone()),
        Box::new(REQUEST_DURATION_SECONDS.clone()),
        Box::new(ACTIVE_CONNECTIONS.clone()),
        Box::new(JOBS_QUEUED.clone()),
        Box::new(JOBS_RUNNING.clone()),
        Box::new(MODEL_INFERENCE_TOTAL.clone()),
        Box::new(ERRORS_TOTAL.clone()),
        Box::new(BACKEND_HEALTH.clone()),
        Box::new(CACHE_LOOKUPS_TOTAL.clone()),
    ];
    for collector in collectors {
        let _ = REGISTRY.register(collector);
    }
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_else(|e| format!("# Error encoding metrics: {e}"))
}

/// Record one finished request.
pub fn record_request(capability: &str, status: &str, duration_secs: f64) {
    REQUESTS_TOTAL.with_label_values(&[capability, status]).inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[capability])
        .observe(duration_secs);
}

/// Record a backend inference call outcome.
pub fn record_inference(capability: &str, status: &str) {
    MODEL_INFERENCE_TOTAL.with_label_values(&[capability, status]).inc();
}

/// Record an error by kind.
pub fn record_error(capability: &str, kind: &str) {
    ERRORS_TOTAL.with_label_values(&[capability, kind]).inc();
}

/// Record a cache lookup outcome: "hit", "miss" or "joined".
pub fn record_cache_lookup(outcome: &str) {
    CACHE_LOOKUPS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Update a backend's health gauge.
pub fn set_backend_health(backend: &str, value: f64) {
    BACKEND_HEALTH.with_label_values(&[backend]).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_encode_contains_names() {
        register_metrics();
        record_request("llm_completion", "success", 0.2);
        set_backend_health("llm", 1.0);
        let text = encode_metrics();
        assert!(text.contains("requests_total"));
        assert!(text.contains("backend_health"));
    }
}
