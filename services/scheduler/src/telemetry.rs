//! Logging setup and trace-id propagation.
//!
//! Every gRPC request and every reconcile pass runs inside a trace-id scope.
//! The id arrives in (or is minted for) the `x-trace-id` metadata key and is
//! forwarded on every outbound agent call.

use std::future::Future;

use tonic::metadata::{MetadataMap, MetadataValue};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LogFormat};

/// Metadata key carrying the trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

tokio::task_local! {
    static TRACE_ID: String;
}

/// Initialize the global subscriber (prefer RUST_LOG, fallback to LOG_LEVEL).
pub fn init(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Trace id of the current scope, or a fresh one outside any scope.
pub fn current_trace_id() -> String {
    TRACE_ID
        .try_with(Clone::clone)
        .unwrap_or_else(|_| new_trace_id())
}

/// Run `fut` with `trace_id` as the current trace id.
pub async fn with_trace_id<F>(trace_id: String, fut: F) -> F::Output
where
    F: Future,
{
    TRACE_ID.scope(trace_id, fut).await
}

/// Extract the inbound trace id, minting one when absent or malformed.
pub fn trace_id_from_metadata(metadata: &MetadataMap) -> String {
    metadata
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(new_trace_id)
}

/// Attach the current trace id to outbound metadata.
pub fn inject_trace_id(metadata: &mut MetadataMap) {
    if let Ok(value) = MetadataValue::try_from(current_trace_id()) {
        metadata.insert(TRACE_ID_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_propagates_trace_id() {
        let seen = with_trace_id("abc123".to_string(), async { current_trace_id() }).await;
        assert_eq!(seen, "abc123");
    }

    #[test]
    fn test_trace_id_minted_outside_scope() {
        let a = current_trace_id();
        let b = current_trace_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_metadata_roundtrip() {
        let mut outbound = MetadataMap::new();
        with_trace_id("trace-1".to_string(), async { inject_trace_id(&mut outbound) }).await;
        assert_eq!(trace_id_from_metadata(&outbound), "trace-1");

        let empty = MetadataMap::new();
        assert_eq!(trace_id_from_metadata(&empty).len(), 32);
    }
}
