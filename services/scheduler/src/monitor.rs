//! Status monitor.
//!
//! Periodically asks each assigned workload's agent for its state and folds
//! the answer into the scheduler's view. Never applies anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::AgentTransport;
use crate::metrics::SchedulerMetrics;
use crate::model::{ActualState, DesiredState, Workload, WorkloadStatus};
use crate::store::{StateStore, StoreError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorStats {
    pub checked: u32,
    pub updated: u32,
    pub missing: u32,
    pub unreachable: u32,
}

pub struct Monitor {
    store: StateStore,
    agent: Arc<dyn AgentTransport>,
    metrics: Arc<SchedulerMetrics>,
    interval: Duration,
}

impl Monitor {
    pub fn new(
        store: StateStore,
        agent: Arc<dyn AgentTransport>,
        metrics: Arc<SchedulerMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            agent,
            metrics,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting workload monitor");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!(error = %e, "Monitor pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Workload monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every assigned workload. Skipped while writes are
    /// frozen.
    #[instrument(skip(self))]
    pub async fn check_once(&self) -> Result<MonitorStats, StoreError> {
        let mut stats = MonitorStats::default();
        if !self.store.mode().writes_allowed() {
            debug!("Skipping monitor pass; writes are frozen");
            return Ok(stats);
        }

        for workload in self.store.list_workloads().await? {
            if workload.status == WorkloadStatus::Deleted {
                continue;
            }
            let Some(node_id) = workload.node_id.clone() else {
                continue;
            };
            // silent nodes are the node health monitor's business
            let Some(node) = self.store.get_node(&node_id).await?.filter(|n| n.is_ready()) else {
                continue;
            };

            stats.checked += 1;
            let observed = match self.agent.get_workload_status(&node, &workload.id).await {
                Ok(status) => Some((status.actual_state, status.message)),
                Err(e) if e.is_not_found() => {
                    stats.missing += 1;
                    None
                }
                Err(e) => {
                    if e.is_unreachable() {
                        stats.unreachable += 1;
                    }
                    debug!(workload_id = %workload.id, node_id = %node_id, error = %e, "Status query failed");
                    continue;
                }
            };

            let id = workload.id.clone();
            match self.fold(workload, observed) {
                Some(updated) => {
                    self.store.put_workload(&updated).await?;
                    stats.updated += 1;
                }
                None => debug!(workload_id = %id, "Workload status unchanged"),
            }
        }

        let nodes = self.store.list_nodes().await?;
        let workloads = self.store.list_workloads().await?;
        self.metrics.refresh_gauges(&nodes, &workloads);

        if stats.updated > 0 || stats.unreachable > 0 {
            info!(
                checked = stats.checked,
                updated = stats.updated,
                missing = stats.missing,
                unreachable = stats.unreachable,
                "Monitor pass complete"
            );
        }
        Ok(stats)
    }

    /// Apply one observation. `None` when nothing changed. A missing
    /// workload is authoritative: deletions complete, anything else goes
    /// back to Pending for the reconciler to re-apply.
    fn fold(&self, mut workload: Workload, observed: Option<(ActualState, Option<String>)>) -> Option<Workload> {
        let now = Utc::now();
        let (actual, message) = match observed {
            Some(observed) => observed,
            None if workload.desired_state == DesiredState::Deleted => {
                workload.status_info.actual_state = Some(ActualState::Missing);
                workload.set_status(WorkloadStatus::Deleted, now);
                workload.append_log("agent no longer reports workload; deletion complete");
                return Some(workload);
            }
            None => (ActualState::Missing, None),
        };

        let status = actual.to_status();
        let mut changed = workload.status_info.actual_state != Some(actual);
        workload.status_info.actual_state = Some(actual);
        if workload.status != status {
            if status == WorkloadStatus::Failed {
                warn!(workload_id = %workload.id, message = ?message, "Agent reports workload failed");
            }
            workload.set_status(status, now);
            changed = true;
        }
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            if workload.logs.last() != Some(&message) {
                workload.append_log(message);
                changed = true;
            }
        }
        if changed {
            workload.touch(now);
            Some(workload)
        } else {
            None
        }
    }
}
