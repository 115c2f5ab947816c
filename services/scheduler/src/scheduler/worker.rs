//! Reconciler background worker.
//!
//! Runs the reconcile cycle on a periodic interval and serves on-demand
//! requests for single workloads in between. Both share one task, so two
//! passes over the same workload never overlap. Fire-and-forget triggers for
//! a workload that is already queued are dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::telemetry::{current_trace_id, new_trace_id, with_trace_id};

/// Ask the worker to reconcile one workload.
#[derive(Debug)]
pub struct ReconcileRequest {
    pub workload_id: String,
    pub trace_id: String,
    pub reply: Option<oneshot::Sender<Option<ReconcileOutcome>>>,
}

/// Workload ids with a fire-and-forget trigger waiting in the queue.
type Pending = Arc<Mutex<HashSet<String>>>;

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashSet<String>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable sender half used by the gRPC service and the drift detector.
#[derive(Debug, Clone)]
pub struct ReconcileHandle {
    tx: mpsc::UnboundedSender<ReconcileRequest>,
    pending: Pending,
}

/// Receiving half, owned by the worker.
#[derive(Debug)]
pub struct ReconcileRequests {
    rx: mpsc::UnboundedReceiver<ReconcileRequest>,
    pending: Pending,
}

impl ReconcileRequests {
    /// Next request. Its id leaves the pending set, so a trigger sent while
    /// the pass runs queues another pass.
    pub async fn recv(&mut self) -> Option<ReconcileRequest> {
        let request = self.rx.recv().await?;
        if request.reply.is_none() {
            lock(&self.pending).remove(&request.workload_id);
        }
        Some(request)
    }
}

impl ReconcileHandle {
    pub fn channel() -> (Self, ReconcileRequests) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Pending::default();
        (
            Self {
                tx,
                pending: pending.clone(),
            },
            ReconcileRequests { rx, pending },
        )
    }

    /// Fire and forget. Coalesced with a trigger already queued for the
    /// same workload.
    pub fn trigger(&self, workload_id: &str) {
        if !lock(&self.pending).insert(workload_id.to_string()) {
            debug!(workload_id, "Reconcile already queued");
            return;
        }
        let request = ReconcileRequest {
            workload_id: workload_id.to_string(),
            trace_id: current_trace_id(),
            reply: None,
        };
        if self.tx.send(request).is_err() {
            lock(&self.pending).remove(workload_id);
            debug!(workload_id, "Reconciler worker is gone; dropping trigger");
        }
    }

    /// Trigger and wait up to `wait` for the outcome. `None` when the worker
    /// did not answer in time or had nothing to do.
    pub async fn trigger_and_wait(&self, workload_id: &str, wait: Duration) -> Option<ReconcileOutcome> {
        let (reply, rx) = oneshot::channel();
        let request = ReconcileRequest {
            workload_id: workload_id.to_string(),
            trace_id: current_trace_id(),
            reply: Some(reply),
        };
        if self.tx.send(request).is_err() {
            return None;
        }
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(workload_id, wait_ms = wait.as_millis() as u64, "Reconcile did not finish in time");
                None
            }
        }
    }
}

pub struct ReconcilerWorker {
    reconciler: Reconciler,
    interval: Duration,
    requests: ReconcileRequests,
}

impl ReconcilerWorker {
    pub fn new(
        reconciler: Reconciler,
        interval: Duration,
        requests: ReconcileRequests,
    ) -> Self {
        Self {
            reconciler,
            interval,
            requests,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            reconciler,
            interval: period,
            mut requests,
        } = self;
        info!(interval_secs = period.as_secs(), "Starting reconciler worker");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = with_trace_id(new_trace_id(), reconciler.run_cycle()).await {
                        error!(error = %e, "Reconcile cycle failed");
                    }
                }
                Some(request) = requests.recv() => {
                    handle_request(&reconciler, request).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_request(reconciler: &Reconciler, request: ReconcileRequest) {
    let ReconcileRequest {
        workload_id,
        trace_id,
        reply,
    } = request;
    let outcome = match with_trace_id(trace_id, reconciler.reconcile_by_id(&workload_id)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(workload_id = %workload_id, error = %e, "On-demand reconcile failed");
            None
        }
    };
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}
