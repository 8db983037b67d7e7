//! Ensemble Gateway Binary
//!
//! Standalone binary for the orchestration gateway. For library usage,
//! see [`ensemble_gateway`].

use ensemble_gateway::{run_server, GatewayConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ensemble_gateway=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    run_server(GatewayConfig::from_env()).await
}

#[cfg(test)]
mod tests {
    use ensemble_gateway::GatewayConfig;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.llm_service_url, "http://localhost:8081");
    }
}
