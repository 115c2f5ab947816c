//! Node records: identity, capability and live state of a registered agent.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkloadType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// `active` is the status legacy records were written with.
    #[serde(alias = "active")]
    Ready,
    NotReady,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::NotReady => "NotReady",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ready" | "active" => Some(Self::Ready),
            "notready" | "not_ready" | "not-ready" => Some(Self::NotReady),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component that last changed a node's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    Register,
    Heartbeat,
    Monitor,
    Reconciler,
}

impl StatusSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Heartbeat => "heartbeat",
            Self::Monitor => "monitor",
            Self::Reconciler => "reconciler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("endpoint {0:?} is not host:port")]
    InvalidEndpoint(String),

    #[error("a NotReady transition needs a reason")]
    EmptyReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    /// `host:port` of the node agent.
    pub grpc_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    pub cpu_total_millicores: u32,
    pub memory_total_mb: u64,
    /// `None` for agents that predate capability reporting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_workload_types: Option<BTreeSet<WorkloadType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub status: NodeStatus,
    #[serde(default)]
    pub status_reason: String,
    pub status_updated_by: StatusSource,
    pub status_updated_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub available_cpu_millicores: u32,
    pub available_memory_mb: u64,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    /// A freshly registered, Ready node with all capacity available.
    pub fn register(
        node_id: impl Into<String>,
        grpc_endpoint: impl Into<String>,
        cpu_total_millicores: u32,
        memory_total_mb: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            grpc_endpoint: grpc_endpoint.into(),
            cluster_id: None,
            cpu_total_millicores,
            memory_total_mb,
            supported_workload_types: None,
            hypervisor: None,
            labels: BTreeMap::new(),
            status: NodeStatus::Ready,
            status_reason: "registered".to_string(),
            status_updated_by: StatusSource::Register,
            status_updated_at: now,
            last_heartbeat: now,
            available_cpu_millicores: cpu_total_millicores,
            available_memory_mb: memory_total_mb,
            registered_at: now,
        }
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = WorkloadType>) -> Self {
        self.supported_workload_types = Some(types.into_iter().collect());
        self
    }

    pub fn is_legacy(&self) -> bool {
        self.supported_workload_types.is_none()
    }

    pub fn is_ready(&self) -> bool {
        self.status == NodeStatus::Ready
    }

    /// Hypervisor reported directly or through a `hypervisor` label.
    pub fn has_hypervisor(&self) -> bool {
        self.hypervisor.as_deref().is_some_and(|h| !h.trim().is_empty())
            || self
                .labels
                .get("hypervisor")
                .is_some_and(|h| !h.trim().is_empty())
    }

    /// Capability check. Legacy nodes accept anything but VMs, which need a
    /// hypervisor signal.
    pub fn supports(&self, workload_type: WorkloadType) -> bool {
        match &self.supported_workload_types {
            Some(types) => types.contains(&workload_type),
            None => workload_type != WorkloadType::Vm || self.has_hypervisor(),
        }
    }

    /// Remove `workload_type` from this node's capabilities. Returns true
    /// when the node could previously run it.
    ///
    /// A legacy node is converted to an explicit list holding everything it
    /// implicitly supported except the removed type.
    pub fn downgrade_capability(&mut self, workload_type: WorkloadType) -> bool {
        let had = self.supports(workload_type);
        let types = match self.supported_workload_types.take() {
            Some(types) => types,
            None => [WorkloadType::Container, WorkloadType::Compose, WorkloadType::Vm]
                .into_iter()
                .filter(|t| self.supports(*t))
                .collect(),
        };
        let mut types = types;
        types.remove(&workload_type);
        if workload_type == WorkloadType::Vm {
            self.hypervisor = None;
        }
        self.supported_workload_types = Some(types);
        had
    }

    /// Monotone: an older timestamp never moves `last_heartbeat` back.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) {
        if at > self.last_heartbeat {
            self.last_heartbeat = at;
        }
    }

    /// Recompute availability from reported usage.
    pub fn apply_usage(&mut self, cpu_used_millicores: u32, memory_used_mb: u64) {
        self.available_cpu_millicores = self.cpu_total_millicores.saturating_sub(cpu_used_millicores);
        self.available_memory_mb = self.memory_total_mb.saturating_sub(memory_used_mb);
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_heartbeat)
    }

    pub fn heartbeat_older_than(&self, limit: std::time::Duration, now: DateTime<Utc>) -> bool {
        let limit = chrono::Duration::from_std(limit).unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.heartbeat_age(now) > limit
    }

    pub fn mark_ready(&mut self, by: StatusSource, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = NodeStatus::Ready;
        self.status_reason = reason.into();
        self.status_updated_by = by;
        self.status_updated_at = now;
    }

    pub fn mark_not_ready(
        &mut self,
        by: StatusSource,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), NodeError> {
        if reason.trim().is_empty() {
            return Err(NodeError::EmptyReason);
        }
        self.status = NodeStatus::NotReady;
        self.status_reason = reason.to_string();
        self.status_updated_by = by;
        self.status_updated_at = now;
        Ok(())
    }

    /// Host part of the agent endpoint.
    pub fn host(&self) -> &str {
        split_endpoint(&self.grpc_endpoint)
            .map(|(host, _)| host)
            .unwrap_or(&self.grpc_endpoint)
    }

    /// Mean of cpu and memory utilization in `[0, 1]`. A dimension with no
    /// capacity counts as fully used.
    pub fn utilization(&self) -> f64 {
        let cpu = ratio(
            u64::from(self.cpu_total_millicores.saturating_sub(self.available_cpu_millicores)),
            u64::from(self.cpu_total_millicores),
        );
        let mem = ratio(
            self.memory_total_mb.saturating_sub(self.available_memory_mb),
            self.memory_total_mb,
        );
        (cpu + mem) / 2.0
    }
}

fn ratio(used: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        used as f64 / total as f64
    }
}

fn split_endpoint(endpoint: &str) -> Option<(&str, &str)> {
    let endpoint = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .unwrap_or(endpoint);
    let (host, port) = endpoint.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host, port))
}

/// Validate `host:port` and return the parts.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), NodeError> {
    let invalid = || NodeError::InvalidEndpoint(endpoint.to_string());
    let (host, port) = split_endpoint(endpoint.trim()).ok_or_else(invalid)?;
    if host.is_empty() || host.contains('/') || host.contains(' ') {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn node() -> Node {
        Node::register("n1", "10.0.0.5:50051", 4000, 8192, Utc::now())
    }

    #[rstest]
    #[case("10.0.0.5:50051", true)]
    #[case("agent.local:7000", true)]
    #[case("[::1]:7000", true)]
    #[case("http://10.0.0.5:50051", true)]
    #[case("10.0.0.5", false)]
    #[case(":50051", false)]
    #[case("10.0.0.5:0", false)]
    #[case("10.0.0.5:http", false)]
    fn test_parse_endpoint(#[case] raw: &str, #[case] ok: bool) {
        assert_eq!(parse_endpoint(raw).is_ok(), ok, "{raw}");
    }

    #[test]
    fn test_available_never_exceeds_total() {
        let mut node = node();
        node.apply_usage(1000, 10_000);
        assert_eq!(node.available_cpu_millicores, 3000);
        assert_eq!(node.available_memory_mb, 0);
    }

    #[test]
    fn test_heartbeat_is_monotone() {
        let mut node = node();
        let later = node.last_heartbeat + chrono::Duration::seconds(30);
        node.record_heartbeat(later);
        node.record_heartbeat(later - chrono::Duration::seconds(90));
        assert_eq!(node.last_heartbeat, later);
    }

    #[test]
    fn test_not_ready_requires_reason() {
        let mut node = node();
        assert_eq!(
            node.mark_not_ready(StatusSource::Monitor, "  ", Utc::now()),
            Err(NodeError::EmptyReason)
        );
        assert!(node.is_ready());
        node.mark_not_ready(StatusSource::Monitor, "heartbeat timeout", Utc::now())
            .unwrap();
        assert_eq!(node.status, NodeStatus::NotReady);
        assert_eq!(node.status_updated_by, StatusSource::Monitor);
    }

    #[test]
    fn test_legacy_capability_rules() {
        let mut node = node();
        assert!(node.supports(WorkloadType::Container));
        assert!(!node.supports(WorkloadType::Vm));
        node.hypervisor = Some("kvm".to_string());
        assert!(node.supports(WorkloadType::Vm));
    }

    #[test]
    fn test_downgrade_removes_exactly_one_type() {
        let mut node = node().with_types([WorkloadType::Container, WorkloadType::Vm]);
        assert!(node.downgrade_capability(WorkloadType::Vm));
        assert_eq!(
            node.supported_workload_types,
            Some([WorkloadType::Container].into_iter().collect())
        );
    }

    #[test]
    fn test_downgrade_legacy_strictly_removes_vm() {
        let mut node = node();
        node.labels.insert("hypervisor".to_string(), "kvm".to_string());
        assert!(node.downgrade_capability(WorkloadType::Vm));
        assert!(!node.supports(WorkloadType::Vm));
        assert!(node.supports(WorkloadType::Container));
        assert!(node.supports(WorkloadType::Compose));
    }

    #[test]
    fn test_utilization() {
        let mut node = node();
        assert_eq!(node.utilization(), 0.0);
        node.apply_usage(2000, 8192);
        assert!((node.utilization() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_legacy_active_status_deserializes() {
        let mut json = serde_json::to_value(node()).unwrap();
        json["status"] = serde_json::json!("active");
        let decoded: Node = serde_json::from_value(json).unwrap();
        assert!(decoded.is_ready());
    }
}
