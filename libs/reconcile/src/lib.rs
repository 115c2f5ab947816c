//! Reconciliation loop primitives.
//!
//! Helpers shared by every loop that converges desired state to observed
//! state on remote agents:
//!
//! - **Revision IDs**: a stable digest of a normalized workload spec, used by
//!   agents for idempotent apply.
//! - **Backoff**: capped exponential delay between retry attempts.
//! - **Convergence**: classification of an observed state against intent.
//!
//! # Invariants
//!
//! - Revision IDs are deterministic for the same spec regardless of key order
//! - Backoff never exceeds its cap
//! - Nothing here performs I/O

use std::time::Duration;

use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a revision ID.
pub const REVISION_BYTES: usize = 12;

/// Default base delay for the first retry.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(5);

/// Default cap on any single retry delay.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(2 * 60);

/// Default attempt budget before a workload is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A deterministic digest of a normalized spec.
///
/// Rendered as 24 lowercase hex characters (12 bytes of SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionId(String);

impl RevisionId {
    /// Compute a revision from a JSON value after canonicalization.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(&result[..REVISION_BYTES]))
    }

    /// Get the hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Capped exponential backoff: `min(base · 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
            max: DEFAULT_RETRY_MAX,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry that follows failure number `attempt` (1-based).
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Convergence status of an observed state against an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed matches intent.
    Converged,

    /// Observed is moving toward intent.
    Converging,

    /// Observed reached a terminal state other than the intent.
    Diverged,

    /// Status is unknown (insufficient data).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if polling should continue.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging | Self::Unknown)
    }
}
