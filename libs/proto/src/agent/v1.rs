//! Node agent control API (`persys.agent.v1`).

use std::collections::HashMap;

include!(concat!(env!("OUT_DIR"), "/persys.agent.v1.AgentService.rs"));

pub use agent_service_client::AgentServiceClient;
pub use agent_service_server::{AgentService, AgentServiceServer};

/// Intent pushed to the agent with every apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DesiredState {
    Unspecified = 0,
    Running = 1,
    Stopped = 2,
}

/// State the agent observes for a workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ActualState {
    Unknown = 0,
    Pending = 1,
    Running = 2,
    Stopped = 3,
    Failed = 4,
}

impl ActualState {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str_name(value: &str) -> Option<Self> {
        match value {
            "UNKNOWN" => Some(Self::Unknown),
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "STOPPED" => Some(Self::Stopped),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WorkloadType {
    Unspecified = 0,
    Container = 1,
    Compose = 2,
    Vm = 3,
}

/// Why an apply was not accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FailureReason {
    Unspecified = 0,
    InvalidSpec = 1,
    RuntimeError = 2,
    RuntimeUnavailable = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceLimits {
    #[prost(uint32, tag = "1")]
    pub cpu_millicores: u32,
    #[prost(uint64, tag = "2")]
    pub memory_mb: u64,
    #[prost(uint64, tag = "3")]
    pub disk_gb: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortMapping {
    #[prost(uint32, tag = "1")]
    pub host_port: u32,
    #[prost(uint32, tag = "2")]
    pub container_port: u32,
    /// `tcp` or `udp`.
    #[prost(string, tag = "3")]
    pub protocol: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeMount {
    #[prost(string, tag = "1")]
    pub host_path: String,
    #[prost(string, tag = "2")]
    pub container_path: String,
    #[prost(bool, tag = "3")]
    pub read_only: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerSpec {
    #[prost(string, tag = "1")]
    pub image: String,
    #[prost(string, repeated, tag = "2")]
    pub command: Vec<String>,
    #[prost(map = "string, string", tag = "3")]
    pub env: HashMap<String, String>,
    #[prost(message, repeated, tag = "4")]
    pub ports: Vec<PortMapping>,
    #[prost(message, repeated, tag = "5")]
    pub volumes: Vec<VolumeMount>,
    #[prost(string, tag = "6")]
    pub restart_policy: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComposeSpec {
    /// Normalized project name (`[a-z0-9_-]`, no leading/trailing dashes).
    #[prost(string, tag = "1")]
    pub project_name: String,
    #[prost(string, tag = "2")]
    pub compose_yaml: String,
    #[prost(string, tag = "3")]
    pub git_repo: String,
    #[prost(string, tag = "4")]
    pub git_ref: String,
    #[prost(string, tag = "5")]
    pub compose_path: String,
    #[prost(map = "string, string", tag = "6")]
    pub env: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmDisk {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(uint64, tag = "3")]
    pub size_gb: u64,
    #[prost(string, tag = "4")]
    pub bus: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmNetwork {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub model: String,
    #[prost(string, tag = "3")]
    pub mac_address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmSpec {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub vcpus: u32,
    #[prost(uint64, tag = "3")]
    pub memory_mb: u64,
    #[prost(message, repeated, tag = "4")]
    pub disks: Vec<VmDisk>,
    #[prost(message, repeated, tag = "5")]
    pub networks: Vec<VmNetwork>,
    #[prost(string, tag = "6")]
    pub cloud_init_user_data: String,
    #[prost(string, tag = "7")]
    pub cloud_init_meta_data: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplyWorkloadRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub revision_id: String,
    #[prost(enumeration = "DesiredState", tag = "3")]
    pub desired_state: i32,
    #[prost(enumeration = "WorkloadType", tag = "4")]
    pub r#type: i32,
    #[prost(message, optional, tag = "5")]
    pub resources: Option<ResourceLimits>,
    #[prost(oneof = "apply_workload_request::Spec", tags = "10, 11, 12")]
    pub spec: Option<apply_workload_request::Spec>,
}

pub mod apply_workload_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Spec {
        #[prost(message, tag = "10")]
        Container(super::ContainerSpec),
        #[prost(message, tag = "11")]
        Compose(super::ComposeSpec),
        #[prost(message, tag = "12")]
        Vm(super::VmSpec),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkloadStatus {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "ActualState", tag = "2")]
    pub actual_state: i32,
    #[prost(string, tag = "3")]
    pub revision_id: String,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(int64, tag = "5")]
    pub updated_at_unix: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplyWorkloadResponse {
    #[prost(bool, tag = "1")]
    pub applied: bool,
    #[prost(bool, tag = "2")]
    pub skipped: bool,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(message, optional, tag = "4")]
    pub status: Option<WorkloadStatus>,
    #[prost(enumeration = "FailureReason", tag = "5")]
    pub failure_reason: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetWorkloadStatusRequest {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetWorkloadStatusResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<WorkloadStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteWorkloadRequest {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteWorkloadResponse {
    #[prost(bool, tag = "1")]
    pub applied: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListWorkloadsRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListWorkloadsResponse {
    #[prost(message, repeated, tag = "1")]
    pub workloads: Vec<WorkloadStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListActionsRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
    #[prost(bool, tag = "2")]
    pub newest_first: bool,
    #[prost(uint32, tag = "3")]
    pub limit: u32,
}

/// One entry of the agent's per-workload action history.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentAction {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub workload_id: String,
    #[prost(string, tag = "3")]
    pub action: String,
    #[prost(string, tag = "4")]
    pub status: String,
    #[prost(string, tag = "5")]
    pub message: String,
    #[prost(int64, tag = "6")]
    pub timestamp_unix: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListActionsResponse {
    #[prost(message, repeated, tag = "1")]
    pub actions: Vec<AgentAction>,
}
