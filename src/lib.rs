//! Ensemble Gateway Library
//!
//! AI orchestration gateway: accepts HTTP requests for AI operations and
//! dispatches them to a fleet of specialized sibling services under one
//! job model, with micro-batching, response caching, admission control
//! and per-backend circuit breaking.
//!
//! This library powers the standalone binary and is also usable directly
//! for embedding or testing the control plane.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub mod admission;
pub mod batcher;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod routes;
pub mod state;
pub mod types;

pub use config::GatewayConfig;
pub use dispatcher::Dispatcher;
pub use state::AppState;

/// How long shutdown waits for in-flight jobs before cancelling them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Build the northbound router for the given state.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(routes::health))
        .route("/health/comprehensive", get(routes::comprehensive))
        .route("/health/ready", get(routes::ready))
        .route("/health/live", get(routes::live))
        .route("/metrics", get(routes::metrics))
        // Capability endpoints
        .route("/ai/llm/completion", post(routes::llm_completion))
        .route("/ai/llm/chat", post(routes::llm_chat))
        .route("/ai/vision/analyze", post(routes::vision_analyze))
        .route("/ai/nlp/process", post(routes::nlp_process))
        .route("/data/process", post(routes::data_process))
        // Job endpoints
        .route("/jobs", get(routes::list_jobs))
        .route("/jobs/:id", get(routes::get_job))
        .route("/jobs/:id", delete(routes::delete_job))
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the gateway server until interrupted.
///
/// # Example
/// ```no_run
/// use ensemble_gateway::{run_server, GatewayConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     run_server(GatewayConfig::from_env()).await
/// }
/// ```
pub async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    info!(
        port = config.port,
        llm = %config.llm_service_url,
        vision = %config.vision_service_url,
        nlp = %config.nlp_service_url,
        data = %config.data_processor_url,
        "Starting Ensemble Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = AppState::new(config.clone())?;
    let router = app(Arc::clone(&state));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on http://{}", addr);
    print_banner(&config);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.dispatcher.shutdown(SHUTDOWN_GRACE).await;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn print_banner(config: &GatewayConfig) {
    println!();
    println!("==================================================");
    println!("  Ensemble Gateway v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: http://0.0.0.0:{}", config.port);
    println!();
    println!("  Backends:");
    println!("    llm:    {}", config.llm_service_url);
    println!("    vision: {}", config.vision_service_url);
    println!("    nlp:    {}", config.nlp_service_url);
    println!("    data:   {}", config.data_processor_url);
    println!();
    println!("  Batcher: size {} / wait {}ms", config.max_batch_size, config.max_batch_wait.as_millis());
    println!(
        "  Cache:   {} entries, TTL {}s{}",
        config.cache_max_entries,
        config.cache_ttl.as_secs(),
        if config.cache_enabled() { "" } else { " (disabled)" }
    );
    println!(
        "  Limits:  {} in-flight per backend, {} pending globally",
        config.max_in_flight, config.global_queue_cap
    );
    println!(
        "  Circuit: opens after {} failures, cools down {}s",
        config.circuit_failure_threshold,
        config.circuit_cooldown.as_secs()
    );
    println!();
    println!("  Endpoints:");
    println!("    POST /ai/llm/completion | /ai/llm/chat");
    println!("    POST /ai/vision/analyze | /ai/nlp/process | /data/process");
    println!("    GET  /jobs/:id, GET /jobs, DELETE /jobs/:id");
    println!("    GET  /health, /health/comprehensive, /metrics");
    println!("==================================================");
    println!();
}
