//! State store adapter.
//!
//! Typed reads and writes over a [`KvBackend`]. Every primitive is retried on
//! transient failure with a fixed backoff; when the attempts run out the
//! mode controller is put into degraded mode and a typed error is returned.
//! Writes are refused unless the mode is normal. Reads are always allowed.

mod backend;
mod cache;
mod error;
mod etcd;
pub mod keys;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use persys_events::{SchedulerEvent, SchedulerEventBuilder};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

pub use backend::{KvBackend, MemoryBackend};
pub use cache::ClusterCache;
pub use error::{BackendError, StoreError};
pub use etcd::EtcdBackend;

use crate::mode::ModeController;
use crate::model::{AssignmentRecord, DriftRecord, Node, ReconciliationRecord, RetryRecord, Workload};

/// Attempts and spacing for store primitives.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KvBackend>,
    mode: Arc<ModeController>,
    policy: RetryPolicy,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvBackend>, mode: Arc<ModeController>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            mode,
            policy: RetryPolicy {
                attempts: policy.attempts.max(1),
                backoff: policy.backoff,
            },
        }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn mode(&self) -> &Arc<ModeController> {
        &self.mode
    }

    pub fn cache(&self) -> &Arc<ClusterCache> {
        self.mode.cache()
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    async fn with_retry<T, F, Fut>(&self, op: &'static str, key: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut last_error = None;
        for attempt in 1..=self.policy.attempts {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e.into()),
                Err(e) => {
                    debug!(op, key, attempt, error = %e, "State store operation failed");
                    last_error = Some(e);
                    if attempt < self.policy.attempts {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }

        let last_error = last_error.map(|e| e.to_string()).unwrap_or_default();
        warn!(
            op,
            key,
            attempts = self.policy.attempts,
            error = %last_error,
            backend = self.backend.name(),
            "State store retries exhausted"
        );
        self.mode
            .enter_degraded(format!("state store {op} on {key} failed: {last_error}"));
        Err(StoreError::RetriesExhausted {
            op,
            key: key.to_string(),
            attempts: self.policy.attempts,
            last_error,
        })
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        match self.mode.write_block() {
            Some((mode, reason)) => Err(StoreError::WritesFrozen { mode, reason }),
            None => Ok(()),
        }
    }

    pub async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.with_retry("put", key, || self.backend.put(key, value.clone()))
            .await
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_retry("get", key, || self.backend.get(key)).await
    }

    pub async fn list_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.with_retry("list", prefix, || self.backend.list(prefix))
            .await
    }

    pub async fn delete_raw(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_writable()?;
        self.with_retry("delete", key, || self.backend.delete(key))
            .await
    }

    pub async fn delete_prefix_raw(&self, prefix: &str) -> Result<u64, StoreError> {
        self.ensure_writable()?;
        self.with_retry("delete_prefix", prefix, || self.backend.delete_prefix(prefix))
            .await
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.put_raw(key, bytes).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode every value under `prefix` accepted by `filter`; undecodable
    /// entries are logged and skipped.
    async fn list_json<T, P>(&self, prefix: &str, filter: P) -> Result<Vec<T>, StoreError>
    where
        T: DeserializeOwned,
        P: Fn(&str) -> bool,
    {
        let entries = self.list_raw(prefix).await?;
        let mut values = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            if !filter(&key) {
                continue;
            }
            match serde_json::from_slice(&bytes) {
                Ok(value) => values.push(value),
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable record"),
            }
        }
        Ok(values)
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn put_node(&self, node: &Node) -> Result<(), StoreError> {
        self.put_json(&keys::node(&node.node_id), node).await?;
        self.put_raw(
            &keys::node_status(&node.node_id),
            node.status.as_str().as_bytes().to_vec(),
        )
        .await?;
        self.cache().upsert_node(node);
        Ok(())
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<Node>, StoreError> {
        let node: Option<Node> = self.get_json(&keys::node(node_id)).await?;
        match &node {
            Some(node) => self.cache().upsert_node(node),
            None => self.cache().remove_node(node_id),
        }
        Ok(node)
    }

    /// All node records in id order; status projections are skipped.
    pub async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let nodes: Vec<Node> = self.list_json(keys::NODES_PREFIX, keys::is_node_record).await?;
        self.cache().replace_nodes(&nodes);
        Ok(nodes)
    }

    /// Short status string from the projection key.
    pub async fn get_node_status(&self, node_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_raw(&keys::node_status(node_id))
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub async fn delete_node(&self, node_id: &str) -> Result<bool, StoreError> {
        let removed = self.delete_raw(&keys::node(node_id)).await?;
        self.delete_raw(&keys::node_status(node_id)).await?;
        self.cache().remove_node(node_id);
        Ok(removed > 0)
    }

    // =========================================================================
    // Workloads
    // =========================================================================

    pub async fn put_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        self.put_json(&keys::workload(&workload.id), workload).await?;
        self.cache().upsert_workload(workload);
        Ok(())
    }

    pub async fn get_workload(&self, workload_id: &str) -> Result<Option<Workload>, StoreError> {
        let workload: Option<Workload> = self.get_json(&keys::workload(workload_id)).await?;
        match &workload {
            Some(w) => self.cache().upsert_workload(w),
            None => self.cache().remove_workload(workload_id),
        }
        Ok(workload)
    }

    pub async fn list_workloads(&self) -> Result<Vec<Workload>, StoreError> {
        let workloads: Vec<Workload> = self.list_json(keys::WORKLOADS_PREFIX, |_| true).await?;
        self.cache().replace_workloads(&workloads);
        Ok(workloads)
    }

    /// Remove a workload together with its assignment, reconciliation and
    /// retry records.
    pub async fn purge_workload(&self, workload_id: &str) -> Result<(), StoreError> {
        self.delete_raw(&keys::workload(workload_id)).await?;
        self.delete_raw(&keys::assignment(workload_id)).await?;
        self.delete_raw(&keys::reconciliation(workload_id)).await?;
        self.delete_raw(&keys::retry(workload_id)).await?;
        self.cache().remove_workload(workload_id);
        self.cache().remove_assignment(workload_id);
        Ok(())
    }

    // =========================================================================
    // Side records
    // =========================================================================

    pub async fn put_assignment(&self, record: &AssignmentRecord) -> Result<(), StoreError> {
        self.put_json(&keys::assignment(&record.workload_id), record)
            .await?;
        self.cache().upsert_assignment(record);
        Ok(())
    }

    pub async fn get_assignment(&self, workload_id: &str) -> Result<Option<AssignmentRecord>, StoreError> {
        self.get_json(&keys::assignment(workload_id)).await
    }

    pub async fn delete_assignment(&self, workload_id: &str) -> Result<(), StoreError> {
        self.delete_raw(&keys::assignment(workload_id)).await?;
        self.cache().remove_assignment(workload_id);
        Ok(())
    }

    pub async fn list_assignments(&self) -> Result<Vec<AssignmentRecord>, StoreError> {
        let records: Vec<AssignmentRecord> =
            self.list_json(keys::ASSIGNMENTS_PREFIX, |_| true).await?;
        self.cache().replace_assignments(&records);
        Ok(records)
    }

    pub async fn put_reconciliation(&self, record: &ReconciliationRecord) -> Result<(), StoreError> {
        self.put_json(&keys::reconciliation(&record.workload_id), record)
            .await
    }

    pub async fn get_reconciliation(
        &self,
        workload_id: &str,
    ) -> Result<Option<ReconciliationRecord>, StoreError> {
        self.get_json(&keys::reconciliation(workload_id)).await
    }

    pub async fn put_retry(&self, record: &RetryRecord) -> Result<(), StoreError> {
        self.put_json(&keys::retry(&record.workload_id), record).await
    }

    pub async fn get_retry(&self, workload_id: &str) -> Result<Option<RetryRecord>, StoreError> {
        self.get_json(&keys::retry(workload_id)).await
    }

    pub async fn put_drift(&self, record: &DriftRecord) -> Result<(), StoreError> {
        self.put_json(&keys::drift(&record.node_id, &record.workload_id), record)
            .await
    }

    pub async fn list_drift(&self) -> Result<Vec<DriftRecord>, StoreError> {
        self.list_json(keys::DRIFT_PREFIX, |_| true).await
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub async fn append_event(&self, event: &SchedulerEvent) -> Result<(), StoreError> {
        self.put_json(&keys::event(&event.id), event).await
    }

    /// Build and append an event. Failures are logged, never returned.
    pub async fn record_event(&self, builder: SchedulerEventBuilder) {
        let event = match builder.build() {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed scheduler event");
                return;
            }
        };
        if let Err(e) = self.append_event(&event).await {
            warn!(event_type = %event.event_type, error = %e, "Failed to record scheduler event");
        }
    }

    /// Events ordered by timestamp.
    pub async fn list_events(&self) -> Result<Vec<SchedulerEvent>, StoreError> {
        let mut events: Vec<SchedulerEvent> = self.list_json(keys::EVENTS_PREFIX, |_| true).await?;
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}
