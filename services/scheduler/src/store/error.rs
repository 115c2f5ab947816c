//! State store error types.

use std::time::Duration;

use thiserror::Error;

use crate::mode::Mode;

/// Errors from a raw key-value backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store request timed out after {0:?}")]
    Timeout(Duration),

    /// The request itself is wrong; retrying will not help.
    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Errors from the typed state store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transient failures persisted through every attempt.
    #[error("{op} {key} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        op: &'static str,
        key: String,
        attempts: u32,
        last_error: String,
    },

    /// The control plane is frozen and refuses writes.
    #[error("control plane frozen ({mode}): {reason}")]
    WritesFrozen { mode: Mode, reason: String },
}

impl StoreError {
    /// Whether the failure is about store availability rather than data.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted { .. } | Self::WritesFrozen { .. } | Self::Backend(_)
        )
    }
}
