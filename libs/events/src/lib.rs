//! # persys-events
//!
//! Control-plane event definitions for the persys scheduler.
//!
//! ## Design Principles
//!
//! - Events are append-only records of scheduler decisions
//! - Every event names the workload and/or node it concerns
//! - Event payloads are flat string maps so operators can grep them
//!
//! ## Event Types
//!
//! - Placement: `WorkloadScheduled`, `Rescheduled`, `CapabilityDowngraded`
//! - Retries: `RetryTriggered`, `WorkloadFailed`
//! - Lifecycle: `WorkloadDeleted`, `NodeRegistered`, `NodeRemoved`, `NodeLost`
//! - Drift: `DriftDetected`

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
