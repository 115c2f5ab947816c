//! Node selection for unassigned workloads.
//!
//! Filters run in a fixed order and the first failing filter names the
//! rejection. Survivors are ranked by mean cpu/memory utilization; the least
//! loaded node wins and ties keep store (node id) order.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{Node, Workload};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("no eligible nodes: {}", describe(.reasons))]
    NoEligibleNodes { reasons: Vec<String> },
}

fn describe(reasons: &[String]) -> String {
    if reasons.is_empty() {
        "no nodes registered".to_string()
    } else {
        reasons.join("; ")
    }
}

/// Every selector pair must be present on the node. An empty selector
/// matches every node.
pub fn matches_labels(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
}

#[derive(Debug, Clone)]
pub struct PlacementEngine {
    heartbeat_max_age: Duration,
}

impl PlacementEngine {
    pub fn new(heartbeat_max_age: Duration) -> Self {
        Self { heartbeat_max_age }
    }

    /// Why `node` cannot take `workload`, or `None` when it can.
    pub fn rejection(&self, workload: &Workload, node: &Node, now: DateTime<Utc>) -> Option<String> {
        if !node.is_ready() {
            return Some(format!("status {}", node.status));
        }
        if node.heartbeat_older_than(self.heartbeat_max_age, now) {
            return Some(format!(
                "heartbeat stale ({}s > {}s)",
                node.heartbeat_age(now).num_seconds(),
                self.heartbeat_max_age.as_secs()
            ));
        }
        if !matches_labels(&workload.spec.labels, &node.labels) {
            return Some("label selector mismatch".to_string());
        }
        let workload_type = workload.workload_type();
        if !node.supports(workload_type) {
            return Some(format!("does not support {workload_type}"));
        }
        let resources = &workload.spec.resources;
        if resources.cpu_millicores > 0 && node.available_cpu_millicores < resources.cpu_millicores {
            return Some(format!(
                "insufficient cpu (available {}m, requested {}m)",
                node.available_cpu_millicores, resources.cpu_millicores
            ));
        }
        if resources.memory_mb > 0 && node.available_memory_mb < resources.memory_mb {
            return Some(format!(
                "insufficient memory (available {}MB, requested {}MB)",
                node.available_memory_mb, resources.memory_mb
            ));
        }
        None
    }

    pub fn place<'a>(
        &self,
        workload: &Workload,
        nodes: &'a [Node],
        now: DateTime<Utc>,
    ) -> Result<&'a Node, PlacementError> {
        self.place_excluding(workload, nodes, None, now)
    }

    /// Like [`place`](Self::place) but never picks `exclude`.
    pub fn place_excluding<'a>(
        &self,
        workload: &Workload,
        nodes: &'a [Node],
        exclude: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<&'a Node, PlacementError> {
        let mut reasons = Vec::new();
        let mut survivors = Vec::new();
        for node in nodes {
            if exclude == Some(node.node_id.as_str()) {
                reasons.push(format!("{}: current node", node.node_id));
                continue;
            }
            match self.rejection(workload, node, now) {
                Some(reason) => reasons.push(format!("{}: {reason}", node.node_id)),
                None => survivors.push(node),
            }
        }

        // stable: equal scores keep store order
        survivors.sort_by(|a, b| a.utilization().total_cmp(&b.utilization()));
        match survivors.first() {
            Some(node) => {
                debug!(
                    workload_id = %workload.id,
                    node_id = %node.node_id,
                    candidates = survivors.len(),
                    rejected = reasons.len(),
                    "Placed workload"
                );
                Ok(node)
            }
            None => Err(PlacementError::NoEligibleNodes { reasons }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ContainerSpec, DesiredState, ResourceRequirements, StatusSource, VmSpec, WorkloadSpec,
        WorkloadType,
    };

    fn engine() -> PlacementEngine {
        PlacementEngine::new(Duration::from_secs(600))
    }

    fn container(cpu: u32, mem: u64) -> Workload {
        let spec = WorkloadSpec::container(ContainerSpec {
            image: "alpine:latest".to_string(),
            ..Default::default()
        })
        .with_resources(ResourceRequirements {
            cpu_millicores: cpu,
            memory_mb: mem,
            disk_gb: 0,
        });
        Workload::new("w1", spec, DesiredState::Running, 5, Utc::now())
    }

    fn node(id: &str, now: DateTime<Utc>) -> Node {
        Node::register(id, format!("10.0.0.{}:7000", id.len()), 4000, 8192, now)
            .with_types([WorkloadType::Container])
    }

    #[test]
    fn test_least_utilized_wins() {
        let now = Utc::now();
        let mut busy = node("n1", now);
        busy.apply_usage(3000, 4096);
        let idle = node("n2", now);
        let nodes = vec![busy, idle];

        let chosen = engine().place(&container(250, 256), &nodes, now).unwrap();
        assert_eq!(chosen.node_id, "n2");
    }

    #[test]
    fn test_ties_keep_store_order() {
        let now = Utc::now();
        let nodes = vec![node("a", now), node("b", now), node("c", now)];
        let chosen = engine().place(&container(0, 0), &nodes, now).unwrap();
        assert_eq!(chosen.node_id, "a");
    }

    #[test]
    fn test_rejections_are_reported_per_node() {
        let now = Utc::now();
        let mut down = node("n1", now);
        down.mark_not_ready(StatusSource::Monitor, "heartbeat timeout", now)
            .unwrap();
        let mut stale = node("n2", now);
        stale.last_heartbeat = now - chrono::Duration::minutes(11);
        let mut small = node("n3", now);
        small.apply_usage(3900, 0);
        let nodes = vec![down, stale, small];

        let err = engine().place(&container(250, 256), &nodes, now).unwrap_err();
        let PlacementError::NoEligibleNodes { reasons } = &err;
        assert_eq!(reasons.len(), 3);
        assert!(reasons[0].starts_with("n1: status NotReady"));
        assert!(reasons[1].starts_with("n2: heartbeat stale"));
        assert!(reasons[2].starts_with("n3: insufficient cpu"));
        assert!(err.to_string().contains("n3: insufficient cpu"));
    }

    #[test]
    fn test_label_selector_subset() {
        let now = Utc::now();
        let mut labelled = node("n1", now);
        labelled.labels.insert("zone".to_string(), "eu-1".to_string());
        labelled.labels.insert("disk".to_string(), "ssd".to_string());
        let nodes = vec![node("n0", now), labelled];

        let mut w = container(0, 0);
        w.spec.labels.insert("zone".to_string(), "eu-1".to_string());
        assert_eq!(engine().place(&w, &nodes, now).unwrap().node_id, "n1");

        w.spec.labels.insert("gpu".to_string(), "a100".to_string());
        assert!(engine().place(&w, &nodes, now).is_err());
    }

    #[test]
    fn test_vm_needs_capability() {
        let now = Utc::now();
        let legacy = Node::register("legacy", "10.0.0.9:7000", 4000, 8192, now);
        let spec = WorkloadSpec {
            workload_type: WorkloadType::Vm,
            vm: Some(VmSpec {
                vcpus: 1,
                memory_mb: 512,
                ..Default::default()
            }),
            container: None,
            compose: None,
            resources: Default::default(),
            labels: Default::default(),
        };
        let vm = Workload::new("vm1", spec, DesiredState::Running, 5, now);
        let nodes = vec![legacy];

        let err = engine().place(&vm, &nodes, now).unwrap_err();
        assert!(err.to_string().contains("does not support vm"));

        let mut nodes = nodes;
        nodes[0].hypervisor = Some("kvm".to_string());
        assert!(engine().place(&vm, &nodes, now).is_ok());
    }

    #[test]
    fn test_exclusion_and_empty_fleet() {
        let now = Utc::now();
        let nodes = vec![node("n1", now)];
        let err = engine()
            .place_excluding(&container(0, 0), &nodes, Some("n1"), now)
            .unwrap_err();
        assert!(err.to_string().contains("n1: current node"));

        let err = engine().place(&container(0, 0), &[], now).unwrap_err();
        assert_eq!(err.to_string(), "no eligible nodes: no nodes registered");
    }
}
