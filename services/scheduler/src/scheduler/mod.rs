//! Placement and the reconcile loop.
//!
//! The reconciler is the only writer of assignments. It runs on a fixed
//! interval and on demand through [`ReconcileHandle`], serialized by a single
//! worker task.

mod placement;
mod reconciler;
mod worker;

pub use placement::{PlacementEngine, PlacementError};
pub use reconciler::{
    needs_reconcile, CycleStats, FailureKind, ReconcileAction, ReconcileError, ReconcileOutcome,
    Reconciler,
};
pub use worker::{ReconcileHandle, ReconcileRequest, ReconcileRequests, ReconcilerWorker};
