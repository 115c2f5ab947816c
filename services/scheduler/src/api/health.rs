//! Health and metrics endpoints.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;

use super::ApiState;
use crate::mode::Mode;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" in normal mode, "degraded" otherwise.
    pub status: String,

    /// Current operational mode.
    pub mode: String,

    /// Why the scheduler is in that mode.
    pub reason: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}

/// Returns 503 whenever writes are not fully available.
async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let mode = state.mode.mode();
    let response = HealthResponse {
        status: if mode == Mode::Normal { "ok" } else { "degraded" }.to_string(),
        mode: mode.as_str().to_string(),
        reason: state.mode.reason(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    };

    if mode == Mode::Normal {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Prometheus text exposition.
async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    state.metrics.set_mode(state.mode.mode());
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::api::create_router;
    use crate::metrics::SchedulerMetrics;
    use crate::mode::ModeController;
    use crate::store::ClusterCache;

    fn state() -> ApiState {
        ApiState {
            mode: Arc::new(ModeController::new(Arc::new(ClusterCache::new()))),
            metrics: Arc::new(SchedulerMetrics::new().unwrap()),
        }
    }

    async fn get(state: ApiState, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health_ok_in_normal_mode() {
        let (status, body) = get(state(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.mode, "normal");
    }

    #[tokio::test]
    async fn test_health_unavailable_when_degraded() {
        let state = state();
        state.mode.enter_degraded("store unreachable");
        let (status, body) = get(state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.mode, "degraded");
        assert_eq!(health.reason, "store unreachable");
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let state = state();
        state.metrics.record_reconcile("Assign", true);
        let (status, body) = get(state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("scheduler_mode"));
        assert!(text.contains("scheduler_reconciliation_results_total"));
    }
}
