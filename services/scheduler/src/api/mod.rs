//! Operational HTTP surface served on the metrics port.

mod health;

use std::sync::Arc;

use axum::Router;

use crate::metrics::SchedulerMetrics;
use crate::mode::ModeController;

pub use health::HealthResponse;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub mode: Arc<ModeController>,
    pub metrics: Arc<SchedulerMetrics>,
}

/// Create the router serving `/health` and `/metrics`.
pub fn create_router(state: ApiState) -> Router {
    Router::new().merge(health::routes()).with_state(state)
}
