//! Application state shared across all handlers.
//!
//! All process-wide state is constructed explicitly at startup and passed
//! to handlers through axum's `State`; nothing initializes behind a
//! hidden global.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;

/// Shared handler state: the dispatcher facade plus configuration.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: GatewayConfig,
}

impl AppState {
    /// Construct the full control plane from configuration.
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>, GatewayError> {
        let dispatcher = Dispatcher::start(config.clone())?;
        Ok(Arc::new(Self { dispatcher, config }))
    }

    /// Construct with an already-started dispatcher (tests).
    pub fn with_dispatcher(config: GatewayConfig, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self { dispatcher, config })
    }
}
