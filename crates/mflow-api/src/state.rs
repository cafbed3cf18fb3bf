//! Application state.

use std::sync::Arc;

use mflow_orchestrator::Orchestrator;
use mflow_queue::MessageChannel;
use mflow_store::JobStore;

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub orchestrator: Arc<Orchestrator>,
    /// Pinged by the readiness probe
    pub store: Arc<dyn JobStore>,
    /// Pinged by the readiness probe
    pub broker: Arc<dyn MessageChannel>,
}

impl AppState {
    pub fn new(
        config: ApiConfig,
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            store,
            broker,
        }
    }
}
