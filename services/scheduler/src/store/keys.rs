//! Key layout of the state store.

pub const NODES_PREFIX: &str = "/nodes/";
pub const WORKLOADS_PREFIX: &str = "/workloads/";
pub const ASSIGNMENTS_PREFIX: &str = "/assignments/";
pub const RECONCILIATION_PREFIX: &str = "/reconciliation/";
pub const RETRIES_PREFIX: &str = "/retries/";
pub const EVENTS_PREFIX: &str = "/events/";
pub const DRIFT_PREFIX: &str = "/drift/";
pub const SKYDNS_PREFIX: &str = "/skydns/";

pub fn node(node_id: &str) -> String {
    format!("{NODES_PREFIX}{node_id}")
}

/// Short status projection next to the node record.
pub fn node_status(node_id: &str) -> String {
    format!("{NODES_PREFIX}{node_id}/status")
}

pub fn workload(workload_id: &str) -> String {
    format!("{WORKLOADS_PREFIX}{workload_id}")
}

pub fn assignment(workload_id: &str) -> String {
    format!("{ASSIGNMENTS_PREFIX}{workload_id}")
}

pub fn reconciliation(workload_id: &str) -> String {
    format!("{RECONCILIATION_PREFIX}{workload_id}")
}

pub fn retry(workload_id: &str) -> String {
    format!("{RETRIES_PREFIX}{workload_id}")
}

pub fn event(event_id: &uuid::Uuid) -> String {
    format!("{EVENTS_PREFIX}{event_id}")
}

pub fn drift(node_id: &str, workload_id: &str) -> String {
    format!("{DRIFT_PREFIX}{node_id}/{workload_id}")
}

/// True for `/nodes/<id>` itself, false for projections below it.
pub fn is_node_record(key: &str) -> bool {
    key.strip_prefix(NODES_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}
