//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when building or decoding events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// A required builder field was not set.
    #[error("missing event field: {0}")]
    MissingField(&'static str),

    /// The event type is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
