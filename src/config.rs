//! Gateway configuration.
//!
//! Every tunable is read from the environment with a `GATEWAY_` prefix;
//! the four backend address variables keep their conventional names so
//! container manifests stay unchanged.

use std::time::Duration;

/// Process-wide configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port the northbound HTTP server listens on.
    pub port: u16,

    /// LLM backend base URL (`LLM_SERVICE_URL`).
    pub llm_service_url: String,
    /// Vision backend base URL (`VISION_SERVICE_URL`).
    pub vision_service_url: String,
    /// NLP backend base URL (`NLP_SERVICE_URL`).
    pub nlp_service_url: String,
    /// Data processor base URL (`DATA_PROCESSOR_URL`).
    pub data_processor_url: String,

    /// Keep-alive slots per backend.
    pub http_pool_connections: usize,
    /// Hard cap on concurrent connections per backend.
    pub http_pool_maxsize: usize,
    /// Default per-call deadline.
    pub http_timeout: Duration,
    /// TCP/TLS handshake deadline.
    pub http_connect_timeout: Duration,

    /// Batcher seal threshold.
    pub max_batch_size: usize,
    /// Batcher time seal.
    pub max_batch_wait: Duration,

    /// Default cache TTL; zero disables the cache.
    pub cache_ttl: Duration,
    /// Bounded cache size (entries).
    pub cache_max_entries: usize,

    /// How long terminal jobs stay queryable.
    pub retention_window: Duration,
    /// Janitor sweep cadence.
    pub janitor_interval: Duration,

    /// Health probe cadence.
    pub probe_interval: Duration,
    /// Consecutive failures before a circuit opens.
    pub circuit_failure_threshold: u32,
    /// Open → half-open delay.
    pub circuit_cooldown: Duration,

    /// Max pending jobs across all capabilities.
    pub global_queue_cap: usize,
    /// Per-backend concurrent call cap.
    pub max_in_flight: usize,

    /// Retry ceiling for retryable failures.
    pub retry_max_attempts: u32,

    /// How long submit handlers wait for a result before answering with a
    /// pollable job id.
    pub wait_for_result: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            llm_service_url: "http://localhost:8081".to_string(),
            vision_service_url: "http://localhost:8082".to_string(),
            nlp_service_url: "http://localhost:8083".to_string(),
            data_processor_url: "http://localhost:8084".to_string(),
            http_pool_connections: 20,
            http_pool_maxsize: 100,
            http_timeout: Duration::from_secs(30),
            http_connect_timeout: Duration::from_secs(5),
            max_batch_size: 8,
            max_batch_wait: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(7200),
            cache_max_entries: 1000,
            retention_window: Duration::from_secs(3600),
            janitor_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(15),
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(30),
            global_queue_cap: 1000,
            max_in_flight: 20,
            retry_max_attempts: 3,
            wait_for_result: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    /// Build configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse("GATEWAY_PORT") {
            config.port = port;
        }

        if let Ok(url) = std::env::var("LLM_SERVICE_URL") {
            config.llm_service_url = url;
        }
        if let Ok(url) = std::env::var("VISION_SERVICE_URL") {
            config.vision_service_url = url;
        }
        if let Ok(url) = std::env::var("NLP_SERVICE_URL") {
            config.nlp_service_url = url;
        }
        if let Ok(url) = std::env::var("DATA_PROCESSOR_URL") {
            config.data_processor_url = url;
        }

        if let Some(n) = env_parse("GATEWAY_HTTP_POOL_CONNECTIONS") {
            config.http_pool_connections = n;
        }
        if let Some(n) = env_parse("GATEWAY_HTTP_POOL_MAXSIZE") {
            config.http_pool_maxsize = n;
        }
        if let Some(secs) = env_parse("GATEWAY_HTTP_TIMEOUT") {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("GATEWAY_HTTP_CONNECT_TIMEOUT") {
            config.http_connect_timeout = Duration::from_secs(secs);
        }

        if let Some(n) = env_parse("GATEWAY_MAX_BATCH_SIZE") {
            config.max_batch_size = n;
        }
        if let Some(ms) = env_parse("GATEWAY_MAX_BATCH_WAIT_MS") {
            config.max_batch_wait = Duration::from_millis(ms);
        }

        if let Some(secs) = env_parse("GATEWAY_CACHE_TTL_SECONDS") {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("GATEWAY_CACHE_MAX_ENTRIES") {
            config.cache_max_entries = n;
        }

        if let Some(secs) = env_parse("GATEWAY_RETENTION_WINDOW_SECONDS") {
            config.retention_window = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("GATEWAY_PROBE_INTERVAL_SECONDS") {
            config.probe_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("GATEWAY_CIRCUIT_FAILURE_THRESHOLD") {
            config.circuit_failure_threshold = n;
        }
        if let Some(secs) = env_parse("GATEWAY_CIRCUIT_COOLDOWN_SECONDS") {
            config.circuit_cooldown = Duration::from_secs(secs);
        }

        if let Some(n) = env_parse("GATEWAY_GLOBAL_QUEUE_CAP") {
            config.global_queue_cap = n;
        }
        if let Some(n) = env_parse("GATEWAY_MAX_IN_FLIGHT") {
            config.max_in_flight = n;
        }
        if let Some(n) = env_parse("GATEWAY_RETRY_MAX_ATTEMPTS") {
            config.retry_max_attempts = n;
        }
        if let Some(secs) = env_parse("GATEWAY_WAIT_FOR_RESULT_SECONDS") {
            config.wait_for_result = Duration::from_secs(secs);
        }

        config
    }

    /// Whether the response cache is enabled at all.
    pub fn cache_enabled(&self) -> bool {
        !self.cache_ttl.is_zero()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_batch_size, 8);
        assert_eq!(config.max_batch_wait, Duration::from_millis(100));
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.global_queue_cap, 1000);
        assert_eq!(config.retry_max_attempts, 3);
        assert!(config.cache_enabled());
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let config = GatewayConfig { cache_ttl: Duration::ZERO, ..Default::default() };
        assert!(!config.cache_enabled());
    }
}
