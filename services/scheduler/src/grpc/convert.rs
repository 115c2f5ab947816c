//! Wire <-> model conversions for the control-plane API.

use std::collections::{BTreeMap, HashMap};

use persys_proto::scheduler::v1 as proto;

use crate::mode::Mode;
use crate::model::{
    CloudInit, ComposeSpec, ContainerSpec, GitSource, Node, ResourceRequirements, SpecError,
    VmDisk, VmNetwork, VmSpec, Workload, WorkloadSpec, WorkloadType,
};

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn sorted(map: HashMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter().collect()
}

fn unsorted(map: &BTreeMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Build and validate a workload spec from an apply request.
pub fn spec_from_request(request: &proto::ApplyWorkloadRequest) -> Result<WorkloadSpec, SpecError> {
    let workload_type = WorkloadType::canonicalize(&request.r#type)
        .ok_or_else(|| SpecError::UnknownType(request.r#type.clone()))?;
    let resources = request
        .resources
        .as_ref()
        .map(|r| ResourceRequirements {
            cpu_millicores: r.cpu_millicores,
            memory_mb: r.memory_mb,
            disk_gb: r.disk_gb,
        })
        .unwrap_or_default();

    let container = request.container.clone().map(|c| ContainerSpec {
        image: c.image.trim().to_string(),
        command: c.command,
        env: sorted(c.env),
        ports: c.ports,
        volumes: c.volumes,
        restart_policy: non_empty(c.restart_policy),
    });
    let compose = request.compose.clone().map(|c| ComposeSpec {
        project_name: c.project_name,
        compose_yaml: non_empty(c.compose_yaml),
        git: non_empty(c.git_repo).map(|repo_url| GitSource {
            repo_url,
            git_ref: non_empty(c.git_ref),
            path: non_empty(c.compose_path),
        }),
        env: sorted(c.env),
    });
    let vm = request.vm.clone().map(|v| {
        let user_data = non_empty(v.cloud_init_user_data);
        let meta_data = non_empty(v.cloud_init_meta_data);
        VmSpec {
            name: non_empty(v.name),
            vcpus: v.vcpus,
            memory_mb: v.memory_mb,
            disks: v
                .disks
                .into_iter()
                .map(|d| VmDisk {
                    name: d.name,
                    source: d.source,
                    size_gb: d.size_gb,
                    bus: non_empty(d.bus),
                })
                .collect(),
            networks: v
                .networks
                .into_iter()
                .map(|n| VmNetwork {
                    name: n.name,
                    model: non_empty(n.model),
                    mac_address: non_empty(n.mac_address),
                })
                .collect(),
            cloud_init: (user_data.is_some() || meta_data.is_some())
                .then_some(CloudInit { user_data, meta_data }),
        }
    });

    // only the payload matching the type is kept so it alone drives the revision
    let spec = WorkloadSpec {
        workload_type,
        resources,
        container: container.filter(|_| workload_type == WorkloadType::Container),
        compose: compose.filter(|_| workload_type == WorkloadType::Compose),
        vm: vm.filter(|_| workload_type == WorkloadType::Vm),
        labels: sorted(request.labels.clone()),
    };
    spec.validate()?;
    Ok(spec)
}

pub fn node_info(node: &Node) -> proto::NodeInfo {
    proto::NodeInfo {
        node_id: node.node_id.clone(),
        grpc_endpoint: node.grpc_endpoint.clone(),
        cluster_id: node.cluster_id.clone().unwrap_or_default(),
        status: node.status.as_str().to_string(),
        status_reason: node.status_reason.clone(),
        status_updated_by: node.status_updated_by.as_str().to_string(),
        cpu_total_millicores: node.cpu_total_millicores,
        memory_total_mb: node.memory_total_mb,
        available_cpu_millicores: node.available_cpu_millicores,
        available_memory_mb: node.available_memory_mb,
        supported_workload_types: node
            .supported_workload_types
            .iter()
            .flatten()
            .map(|t| t.as_str().to_string())
            .collect(),
        labels: unsorted(&node.labels),
        last_heartbeat_unix: node.last_heartbeat.timestamp(),
    }
}

pub fn workload_info(workload: &Workload) -> proto::WorkloadInfo {
    let resources = &workload.spec.resources;
    proto::WorkloadInfo {
        workload_id: workload.id.clone(),
        revision_id: workload.revision_id.clone(),
        r#type: workload.workload_type().as_str().to_string(),
        desired_state: workload.desired_state.as_str().to_string(),
        status: workload.status.as_str().to_string(),
        actual_state: workload
            .status_info
            .actual_state
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        failure_reason: workload.status_info.failure_reason.clone().unwrap_or_default(),
        node_id: workload.node_id.clone().unwrap_or_default(),
        attempts: workload.retry.attempts,
        max_attempts: workload.retry.max_attempts,
        next_retry_at_unix: workload.retry.next_retry_at.map_or(0, |t| t.timestamp()),
        last_action: workload.metadata.last_action.clone().unwrap_or_default(),
        last_error: workload.metadata.last_error.clone().unwrap_or_default(),
        logs: workload.logs.clone(),
        resources: Some(proto::Resources {
            cpu_millicores: resources.cpu_millicores,
            memory_mb: resources.memory_mb,
            disk_gb: resources.disk_gb,
        }),
        labels: unsorted(&workload.spec.labels),
    }
}

/// Counts and capacity over a node and workload listing.
pub fn cluster_summary(nodes: &[Node], workloads: &[Workload], mode: Mode) -> proto::GetClusterSummaryResponse {
    let mut summary = proto::GetClusterSummaryResponse {
        total_nodes: nodes.len() as u32,
        total_workloads: workloads.len() as u32,
        mode: mode.as_str().to_string(),
        ..Default::default()
    };
    for node in nodes {
        if node.is_ready() {
            summary.ready_nodes += 1;
        }
        summary.total_cpu_millicores += u64::from(node.cpu_total_millicores);
        summary.available_cpu_millicores += u64::from(node.available_cpu_millicores);
        summary.total_memory_mb += node.memory_total_mb;
        summary.available_memory_mb += node.available_memory_mb;
    }
    for workload in workloads {
        *summary
            .workloads_by_status
            .entry(workload.status.as_str().to_string())
            .or_default() += 1;
        *summary
            .workloads_by_desired_state
            .entry(workload.desired_state.as_str().to_string())
            .or_default() += 1;
    }
    summary
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rstest::rstest;

    use super::*;
    use crate::model::DesiredState;

    fn container_request(r#type: &str, image: &str) -> proto::ApplyWorkloadRequest {
        proto::ApplyWorkloadRequest {
            workload_id: "w1".to_string(),
            r#type: r#type.to_string(),
            container: Some(proto::ContainerSpec {
                image: image.to_string(),
                ports: vec!["8080:80".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("container")]
    #[case("docker-container")]
    #[case("Docker")]
    fn test_container_aliases(#[case] r#type: &str) {
        let spec = spec_from_request(&container_request(r#type, "alpine:latest")).unwrap();
        assert_eq!(spec.workload_type, WorkloadType::Container);
        assert_eq!(spec.container.unwrap().image, "alpine:latest");
    }

    #[rstest]
    #[case("", SpecError::UnknownType(String::new()))]
    #[case("lambda", SpecError::UnknownType("lambda".to_string()))]
    fn test_unknown_type(#[case] r#type: &str, #[case] expected: SpecError) {
        assert_eq!(spec_from_request(&container_request(r#type, "alpine")).unwrap_err(), expected);
    }

    #[test]
    fn test_mismatched_payload_is_rejected() {
        let mut request = container_request("vm", "alpine");
        request.vm = None;
        assert_eq!(
            spec_from_request(&request).unwrap_err(),
            SpecError::MissingSubspec(WorkloadType::Vm)
        );
        assert_eq!(
            spec_from_request(&container_request("container", " ")).unwrap_err(),
            SpecError::EmptyImage
        );
    }

    #[test]
    fn test_stray_payload_does_not_change_revision() {
        let plain = spec_from_request(&container_request("container", "alpine")).unwrap();
        let mut noisy = container_request("container", "alpine");
        noisy.vm = Some(proto::VmSpec {
            vcpus: 2,
            memory_mb: 512,
            ..Default::default()
        });
        let noisy = spec_from_request(&noisy).unwrap();
        assert_eq!(plain.revision_id(), noisy.revision_id());
    }

    #[test]
    fn test_summary_counts() {
        let now = Utc::now();
        let mut down = Node::register("n2", "10.0.0.2:7000", 2000, 2048, now);
        down.mark_not_ready(crate::model::StatusSource::Monitor, "heartbeat timeout", now)
            .unwrap();
        let nodes = vec![Node::register("n1", "10.0.0.1:7000", 4000, 8192, now), down];
        let spec = spec_from_request(&container_request("container", "alpine")).unwrap();
        let workloads = vec![
            Workload::new("a", spec.clone(), DesiredState::Running, 5, now),
            Workload::new("b", spec, DesiredState::Stopped, 5, now),
        ];

        let summary = cluster_summary(&nodes, &workloads, Mode::Normal);
        assert_eq!(summary.total_nodes, 2);
        assert_eq!(summary.ready_nodes, 1);
        assert_eq!(summary.total_cpu_millicores, 6000);
        assert_eq!(summary.workloads_by_status["Pending"], 2);
        assert_eq!(summary.workloads_by_desired_state["Stopped"], 1);
        assert_eq!(summary.mode, "normal");
    }
}
