//! Workload record to agent apply request.

use persys_proto::agent::v1 as proto;

use super::AgentError;
use crate::model::{DesiredState, SpecError, Workload, WorkloadType};

/// Parse `host:container[/proto]`. A bare `port` maps the port to itself.
pub fn parse_port_mapping(raw: &str) -> Result<proto::PortMapping, SpecError> {
    let invalid = || SpecError::InvalidPort(raw.to_string());
    let trimmed = raw.trim();
    let (ports, protocol) = match trimmed.split_once('/') {
        Some((ports, protocol)) => (ports, protocol.to_ascii_lowercase()),
        None => (trimmed, "tcp".to_string()),
    };
    if protocol != "tcp" && protocol != "udp" {
        return Err(invalid());
    }
    let (host, container) = match ports.split_once(':') {
        Some((host, container)) => (host, container),
        None => (ports, ports),
    };
    let host_port: u16 = host.parse().map_err(|_| invalid())?;
    let container_port: u16 = container.parse().map_err(|_| invalid())?;
    if host_port == 0 || container_port == 0 {
        return Err(invalid());
    }
    Ok(proto::PortMapping {
        host_port: u32::from(host_port),
        container_port: u32::from(container_port),
        protocol,
    })
}

/// Parse `host:container[:ro|:rw]`.
pub fn parse_volume(raw: &str) -> Result<proto::VolumeMount, SpecError> {
    let invalid = || SpecError::InvalidVolume(raw.to_string());
    let parts: Vec<&str> = raw.trim().split(':').collect();
    let (host, container, read_only) = match parts.as_slice() {
        [host, container] => (*host, *container, false),
        [host, container, "ro"] => (*host, *container, true),
        [host, container, "rw"] => (*host, *container, false),
        _ => return Err(invalid()),
    };
    if host.is_empty() || container.is_empty() || !container.starts_with('/') {
        return Err(invalid());
    }
    Ok(proto::VolumeMount {
        host_path: host.to_string(),
        container_path: container.to_string(),
        read_only,
    })
}

/// Compose project names: lowercase, `[a-z0-9_-]` only, no leading or
/// trailing dashes.
pub fn normalize_project_name(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '-',
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

pub fn proto_workload_type(workload_type: WorkloadType) -> proto::WorkloadType {
    match workload_type {
        WorkloadType::Container => proto::WorkloadType::Container,
        WorkloadType::Compose => proto::WorkloadType::Compose,
        WorkloadType::Vm => proto::WorkloadType::Vm,
    }
}

/// Build the agent request for `workload`. The revision is computed from the
/// spec when the record carries none.
pub fn to_apply_request(
    workload: &Workload,
    desired: DesiredState,
) -> Result<proto::ApplyWorkloadRequest, AgentError> {
    let desired_state = match desired {
        DesiredState::Running => proto::DesiredState::Running,
        DesiredState::Stopped => proto::DesiredState::Stopped,
        DesiredState::Deleted => {
            return Err(AgentError::Translation(
                "Deleted is not an apply intent".to_string(),
            ))
        }
    };
    let revision_id = if workload.revision_id.is_empty() {
        workload.spec.revision_id().into_string()
    } else {
        workload.revision_id.clone()
    };

    let spec = &workload.spec;
    let missing = || AgentError::Translation(format!("{} spec is missing", spec.workload_type));
    let payload = match spec.workload_type {
        WorkloadType::Container => {
            let container = spec.container.as_ref().ok_or_else(missing)?;
            let ports = container
                .ports
                .iter()
                .map(|p| parse_port_mapping(p))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AgentError::Translation(e.to_string()))?;
            let volumes = container
                .volumes
                .iter()
                .map(|v| parse_volume(v))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AgentError::Translation(e.to_string()))?;
            proto::apply_workload_request::Spec::Container(proto::ContainerSpec {
                image: container.image.clone(),
                command: container.command.clone(),
                env: container.env.clone().into_iter().collect(),
                ports,
                volumes,
                restart_policy: container.restart_policy.clone().unwrap_or_default(),
            })
        }
        WorkloadType::Compose => {
            let compose = spec.compose.as_ref().ok_or_else(missing)?;
            let mut project_name = normalize_project_name(&compose.project_name);
            if project_name.is_empty() {
                project_name = normalize_project_name(&workload.id);
            }
            let git = compose.git.as_ref();
            proto::apply_workload_request::Spec::Compose(proto::ComposeSpec {
                project_name,
                compose_yaml: compose.compose_yaml.clone().unwrap_or_default(),
                git_repo: git.map(|g| g.repo_url.clone()).unwrap_or_default(),
                git_ref: git.and_then(|g| g.git_ref.clone()).unwrap_or_default(),
                compose_path: git.and_then(|g| g.path.clone()).unwrap_or_default(),
                env: compose.env.clone().into_iter().collect(),
            })
        }
        WorkloadType::Vm => {
            let vm = spec.vm.as_ref().ok_or_else(missing)?;
            let cloud_init = vm.cloud_init.clone().unwrap_or_default();
            proto::apply_workload_request::Spec::Vm(proto::VmSpec {
                name: vm.name.clone().unwrap_or_else(|| workload.id.clone()),
                vcpus: vm.vcpus,
                memory_mb: vm.memory_mb,
                disks: vm
                    .disks
                    .iter()
                    .map(|d| proto::VmDisk {
                        name: d.name.clone(),
                        source: d.source.clone(),
                        size_gb: d.size_gb,
                        bus: d.bus.clone().unwrap_or_else(|| "virtio".to_string()),
                    })
                    .collect(),
                networks: vm
                    .networks
                    .iter()
                    .map(|n| proto::VmNetwork {
                        name: n.name.clone(),
                        model: n.model.clone().unwrap_or_else(|| "virtio".to_string()),
                        mac_address: n.mac_address.clone().unwrap_or_default(),
                    })
                    .collect(),
                cloud_init_user_data: cloud_init.user_data.unwrap_or_default(),
                cloud_init_meta_data: cloud_init.meta_data.unwrap_or_default(),
            })
        }
    };

    Ok(proto::ApplyWorkloadRequest {
        id: workload.id.clone(),
        revision_id,
        desired_state: desired_state.into(),
        r#type: proto_workload_type(spec.workload_type).into(),
        resources: Some(proto::ResourceLimits {
            cpu_millicores: spec.resources.cpu_millicores,
            memory_mb: spec.resources.memory_mb,
            disk_gb: spec.resources.disk_gb,
        }),
        spec: Some(payload),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rstest::rstest;

    use super::*;
    use crate::model::{ComposeSpec, ContainerSpec, VmSpec, WorkloadSpec};

    #[rstest]
    #[case("8080:80", 8080, 80, "tcp")]
    #[case("5353:53/udp", 5353, 53, "udp")]
    #[case("443/TCP", 443, 443, "tcp")]
    fn test_port_mapping(
        #[case] raw: &str,
        #[case] host: u32,
        #[case] container: u32,
        #[case] protocol: &str,
    ) {
        let mapping = parse_port_mapping(raw).unwrap();
        assert_eq!(mapping.host_port, host);
        assert_eq!(mapping.container_port, container);
        assert_eq!(mapping.protocol, protocol);
    }

    #[rstest]
    #[case("eighty")]
    #[case("80:80/sctp")]
    #[case("0:80")]
    #[case("70000:80")]
    fn test_port_mapping_rejects(#[case] raw: &str) {
        assert_eq!(parse_port_mapping(raw), Err(SpecError::InvalidPort(raw.to_string())));
    }

    #[rstest]
    #[case("/data:/var/lib/data", false)]
    #[case("/etc/app:/etc/app:ro", true)]
    #[case("cache:/cache:rw", false)]
    fn test_volume(#[case] raw: &str, #[case] read_only: bool) {
        assert_eq!(parse_volume(raw).unwrap().read_only, read_only);
    }

    #[rstest]
    #[case("/data")]
    #[case("/data:relative")]
    #[case("/a:/b:rx")]
    fn test_volume_rejects(#[case] raw: &str) {
        assert!(parse_volume(raw).is_err());
    }

    #[rstest]
    #[case("My Project!", "my-project")]
    #[case("--web_stack--", "web_stack")]
    #[case("API.v2", "api-v2")]
    fn test_project_name(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_project_name(raw), expected);
    }

    #[test]
    fn test_container_request() {
        let spec = WorkloadSpec::container(ContainerSpec {
            image: "nginx:1.27".to_string(),
            ports: vec!["8080:80".to_string()],
            volumes: vec!["/srv:/usr/share/nginx/html:ro".to_string()],
            ..Default::default()
        });
        let workload = Workload::new("w1", spec, DesiredState::Running, 5, Utc::now());
        let request = to_apply_request(&workload, DesiredState::Stopped).unwrap();

        assert_eq!(request.revision_id, workload.revision_id);
        assert_eq!(request.desired_state, i32::from(proto::DesiredState::Stopped));
        let Some(proto::apply_workload_request::Spec::Container(c)) = request.spec else {
            panic!("expected container payload");
        };
        assert_eq!(c.ports[0].container_port, 80);
        assert!(c.volumes[0].read_only);
    }

    #[test]
    fn test_missing_revision_is_computed() {
        let spec = WorkloadSpec::container(ContainerSpec {
            image: "alpine:latest".to_string(),
            ..Default::default()
        });
        let mut workload = Workload::new("w1", spec.clone(), DesiredState::Running, 5, Utc::now());
        workload.revision_id.clear();
        let request = to_apply_request(&workload, DesiredState::Running).unwrap();
        assert_eq!(request.revision_id, spec.revision_id().as_str());
    }

    #[test]
    fn test_compose_project_falls_back_to_id() {
        let spec = WorkloadSpec {
            workload_type: WorkloadType::Compose,
            compose: Some(ComposeSpec {
                project_name: "!!!".to_string(),
                compose_yaml: Some("services: {}".to_string()),
                ..Default::default()
            }),
            container: None,
            vm: None,
            resources: Default::default(),
            labels: Default::default(),
        };
        let workload = Workload::new("Shop-Frontend", spec, DesiredState::Running, 5, Utc::now());
        let request = to_apply_request(&workload, DesiredState::Running).unwrap();
        let Some(proto::apply_workload_request::Spec::Compose(c)) = request.spec else {
            panic!("expected compose payload");
        };
        assert_eq!(c.project_name, "shop-frontend");
    }

    #[test]
    fn test_vm_defaults_and_deleted_intent() {
        let spec = WorkloadSpec {
            workload_type: WorkloadType::Vm,
            vm: Some(VmSpec {
                vcpus: 2,
                memory_mb: 2048,
                ..Default::default()
            }),
            container: None,
            compose: None,
            resources: Default::default(),
            labels: Default::default(),
        };
        let workload = Workload::new("vm-1", spec, DesiredState::Running, 5, Utc::now());
        let request = to_apply_request(&workload, DesiredState::Running).unwrap();
        assert_eq!(request.r#type, i32::from(proto::WorkloadType::Vm));
        let Some(proto::apply_workload_request::Spec::Vm(vm)) = request.spec else {
            panic!("expected vm payload");
        };
        assert_eq!(vm.name, "vm-1");

        assert!(matches!(
            to_apply_request(&workload, DesiredState::Deleted),
            Err(AgentError::Translation(_))
        ));
    }
}
