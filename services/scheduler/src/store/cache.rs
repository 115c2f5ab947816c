//! Write-through caches of nodes, workloads and assignments.
//!
//! Each map has its own lock. Entries change only after the matching store
//! write succeeded.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::model::{AssignmentRecord, Node, Workload};

#[derive(Debug, Default)]
pub struct ClusterCache {
    nodes: RwLock<HashMap<String, Node>>,
    workloads: RwLock<HashMap<String, Workload>>,
    assignments: RwLock<HashMap<String, AssignmentRecord>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ClusterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_node(&self, node: &Node) {
        write(&self.nodes).insert(node.node_id.clone(), node.clone());
    }

    pub fn remove_node(&self, node_id: &str) {
        write(&self.nodes).remove(node_id);
    }

    pub fn replace_nodes(&self, nodes: &[Node]) {
        *write(&self.nodes) = nodes
            .iter()
            .map(|n| (n.node_id.clone(), n.clone()))
            .collect();
    }

    /// Nodes ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = read(&self.nodes).values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn upsert_workload(&self, workload: &Workload) {
        write(&self.workloads).insert(workload.id.clone(), workload.clone());
    }

    pub fn remove_workload(&self, workload_id: &str) {
        write(&self.workloads).remove(workload_id);
    }

    pub fn replace_workloads(&self, workloads: &[Workload]) {
        *write(&self.workloads) = workloads
            .iter()
            .map(|w| (w.id.clone(), w.clone()))
            .collect();
    }

    /// Workloads ordered by id.
    pub fn workloads(&self) -> Vec<Workload> {
        let mut workloads: Vec<Workload> = read(&self.workloads).values().cloned().collect();
        workloads.sort_by(|a, b| a.id.cmp(&b.id));
        workloads
    }

    pub fn upsert_assignment(&self, record: &AssignmentRecord) {
        write(&self.assignments).insert(record.workload_id.clone(), record.clone());
    }

    pub fn remove_assignment(&self, workload_id: &str) {
        write(&self.assignments).remove(workload_id);
    }

    pub fn replace_assignments(&self, records: &[AssignmentRecord]) {
        *write(&self.assignments) = records
            .iter()
            .map(|r| (r.workload_id.clone(), r.clone()))
            .collect();
    }

    pub fn assignments(&self) -> Vec<AssignmentRecord> {
        let mut records: Vec<AssignmentRecord> =
            read(&self.assignments).values().cloned().collect();
        records.sort_by(|a, b| a.workload_id.cmp(&b.workload_id));
        records
    }
}
