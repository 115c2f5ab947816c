//! Node liveness.
//!
//! A node stays Ready only while it heartbeats: once `now - last_heartbeat`
//! exceeds three heartbeat intervals it is marked NotReady and the Running
//! workloads on it drop to Unknown until the reconciler fails them over.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use persys_events::{EventType, SchedulerEvent};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::metrics::SchedulerMetrics;
use crate::model::{Node, StatusSource, WorkloadStatus};
use crate::store::{StateStore, StoreError};

pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Heartbeats missed before a node is considered lost.
pub const MISSED_HEARTBEATS: u32 = 3;

/// Persist a Ready to NotReady transition, demote the node's Running
/// workloads to Unknown and record `NodeLost`.
///
/// Returns false when the node was already NotReady.
pub async fn mark_node_not_ready(
    store: &StateStore,
    node: &mut Node,
    by: StatusSource,
    reason: &str,
) -> Result<bool, StoreError> {
    if !node.is_ready() {
        return Ok(false);
    }
    let now = Utc::now();
    if let Err(e) = node.mark_not_ready(by, reason, now) {
        warn!(node_id = %node.node_id, error = %e, "Refusing NotReady transition");
        return Ok(false);
    }
    store.put_node(node).await?;
    warn!(node_id = %node.node_id, by = by.as_str(), reason, "Node marked NotReady");
    demote_workloads(store, &node.node_id, reason).await?;
    store
        .record_event(
            SchedulerEvent::builder(EventType::NodeLost)
                .node(node.node_id.clone())
                .reason(reason)
                .detail("by", by.as_str())
                .timestamp(now),
        )
        .await;
    Ok(true)
}

async fn demote_workloads(store: &StateStore, node_id: &str, reason: &str) -> Result<(), StoreError> {
    let now = Utc::now();
    for mut workload in store.list_workloads().await? {
        if workload.node_id.as_deref() != Some(node_id) || workload.status != WorkloadStatus::Running {
            continue;
        }
        workload.set_status(WorkloadStatus::Unknown, now);
        workload.append_log(format!("node {node_id} lost: {reason}"));
        store.put_workload(&workload).await?;
    }
    Ok(())
}

pub struct NodeHealthMonitor {
    store: StateStore,
    metrics: Arc<SchedulerMetrics>,
    interval: Duration,
    timeout: Duration,
}

impl NodeHealthMonitor {
    /// `heartbeat_interval` is the period agents were told to heartbeat at.
    pub fn new(store: StateStore, metrics: Arc<SchedulerMetrics>, heartbeat_interval: Duration) -> Self {
        Self {
            store,
            metrics,
            interval: heartbeat_interval,
            timeout: heartbeat_interval * MISSED_HEARTBEATS,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "Starting node health monitor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!(error = %e, "Node health check failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Node health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Mark silent nodes NotReady. Returns the ids that changed.
    pub async fn check_once(&self) -> Result<Vec<String>, StoreError> {
        if !self.store.mode().writes_allowed() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut lost = Vec::new();
        for mut node in self.store.list_nodes().await? {
            if !node.is_ready() || !node.heartbeat_older_than(self.timeout, now) {
                continue;
            }
            if mark_node_not_ready(&self.store, &mut node, StatusSource::Monitor, HEARTBEAT_TIMEOUT_REASON)
                .await?
            {
                lost.push(node.node_id);
            }
        }

        if !lost.is_empty() {
            let nodes = self.store.list_nodes().await?;
            let workloads = self.store.list_workloads().await?;
            self.metrics.refresh_gauges(&nodes, &workloads);
        }
        Ok(lost)
    }
}
