//! Scheduler control-plane API (`persys.scheduler.v1`).
//!
//! States and workload types travel as strings here: the server canonicalizes
//! them (`docker-container` → `container`, unknown desired states → Running).

use std::collections::HashMap;

include!(concat!(env!("OUT_DIR"), "/persys.scheduler.v1.SchedulerControl.rs"));

pub use scheduler_control_client::SchedulerControlClient;
pub use scheduler_control_server::{SchedulerControl, SchedulerControlServer};

// =============================================================================
// Nodes
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterNodeRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
    /// `host:port` of the node-local agent.
    #[prost(string, tag = "2")]
    pub grpc_endpoint: String,
    #[prost(string, tag = "3")]
    pub cluster_id: String,
    #[prost(uint32, tag = "4")]
    pub cpu_total_millicores: u32,
    #[prost(uint64, tag = "5")]
    pub memory_total_mb: u64,
    /// Empty means the agent predates capability reporting.
    #[prost(string, repeated, tag = "6")]
    pub supported_workload_types: Vec<String>,
    #[prost(map = "string, string", tag = "7")]
    pub labels: HashMap<String, String>,
    /// Hypervisor the agent drives (e.g. `kvm`); empty when none.
    #[prost(string, tag = "8")]
    pub hypervisor: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterNodeResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(uint32, tag = "2")]
    pub heartbeat_interval_seconds: u32,
    #[prost(int64, tag = "3")]
    pub lease_expires_at_unix: i64,
    #[prost(string, tag = "4")]
    pub message: String,
}

/// Per-workload status carried on a heartbeat.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkloadReport {
    #[prost(string, tag = "1")]
    pub workload_id: String,
    /// PENDING / RUNNING / STOPPED / FAILED / UNKNOWN.
    #[prost(string, tag = "2")]
    pub actual_state: String,
    #[prost(string, tag = "3")]
    pub revision_id: String,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(string, repeated, tag = "5")]
    pub logs: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(uint32, tag = "2")]
    pub cpu_used_millicores: u32,
    #[prost(uint64, tag = "3")]
    pub memory_used_mb: u64,
    #[prost(message, repeated, tag = "4")]
    pub workloads: Vec<WorkloadReport>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatResponse {
    #[prost(bool, tag = "1")]
    pub acknowledged: bool,
    #[prost(bool, tag = "2")]
    pub drain: bool,
    #[prost(int64, tag = "3")]
    pub lease_expires_at_unix: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteNodeRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteNodeResponse {
    #[prost(bool, tag = "1")]
    pub deleted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub grpc_endpoint: String,
    #[prost(string, tag = "3")]
    pub cluster_id: String,
    #[prost(string, tag = "4")]
    pub status: String,
    #[prost(string, tag = "5")]
    pub status_reason: String,
    #[prost(string, tag = "6")]
    pub status_updated_by: String,
    #[prost(uint32, tag = "7")]
    pub cpu_total_millicores: u32,
    #[prost(uint64, tag = "8")]
    pub memory_total_mb: u64,
    #[prost(uint32, tag = "9")]
    pub available_cpu_millicores: u32,
    #[prost(uint64, tag = "10")]
    pub available_memory_mb: u64,
    #[prost(string, repeated, tag = "11")]
    pub supported_workload_types: Vec<String>,
    #[prost(map = "string, string", tag = "12")]
    pub labels: HashMap<String, String>,
    #[prost(int64, tag = "13")]
    pub last_heartbeat_unix: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListNodesRequest {
    /// Optional filter (`Ready` / `NotReady`).
    #[prost(string, tag = "1")]
    pub status: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListNodesResponse {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetNodeRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetNodeResponse {
    #[prost(message, optional, tag = "1")]
    pub node: Option<NodeInfo>,
}

// =============================================================================
// Workloads
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resources {
    #[prost(uint32, tag = "1")]
    pub cpu_millicores: u32,
    #[prost(uint64, tag = "2")]
    pub memory_mb: u64,
    #[prost(uint64, tag = "3")]
    pub disk_gb: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerSpec {
    #[prost(string, tag = "1")]
    pub image: String,
    #[prost(string, repeated, tag = "2")]
    pub command: Vec<String>,
    #[prost(map = "string, string", tag = "3")]
    pub env: HashMap<String, String>,
    /// `host:container[/proto]`.
    #[prost(string, repeated, tag = "4")]
    pub ports: Vec<String>,
    /// `host:container[:ro]`.
    #[prost(string, repeated, tag = "5")]
    pub volumes: Vec<String>,
    #[prost(string, tag = "6")]
    pub restart_policy: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComposeSpec {
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
    /// Generated when empty.
    #[prost(string, tag = "1")]
    pub workload_id: String,
    /// `container`, `compose`, `vm` or a legacy alias.
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(string, tag = "3")]
    pub desired_state: String,
    #[prost(message, optional, tag = "4")]
    pub resources: Option<Resources>,
    #[prost(map = "string, string", tag = "5")]
    pub labels: HashMap<String, String>,
    #[prost(uint32, tag = "6")]
    pub max_attempts: u32,
    #[prost(message, optional, tag = "10")]
    pub container: Option<ContainerSpec>,
    #[prost(message, optional, tag = "11")]
    pub compose: Option<ComposeSpec>,
    #[prost(message, optional, tag = "12")]
    pub vm: Option<VmSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplyWorkloadResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub workload_id: String,
    #[prost(string, tag = "3")]
    pub revision_id: String,
    #[prost(string, tag = "4")]
    pub status: String,
    /// `INVALID_SPEC` or `RUNTIME_ERROR` when `success` is false.
    #[prost(string, tag = "5")]
    pub failure_reason: String,
    #[prost(string, tag = "6")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteWorkloadRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteWorkloadResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetryWorkloadRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetryWorkloadResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(int64, tag = "2")]
    pub next_retry_at_unix: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkloadInfo {
    #[prost(string, tag = "1")]
    pub workload_id: String,
    #[prost(string, tag = "2")]
    pub revision_id: String,
    #[prost(string, tag = "3")]
    pub r#type: String,
    #[prost(string, tag = "4")]
    pub desired_state: String,
    #[prost(string, tag = "5")]
    pub status: String,
    #[prost(string, tag = "6")]
    pub actual_state: String,
    #[prost(string, tag = "7")]
    pub failure_reason: String,
    #[prost(string, tag = "8")]
    pub node_id: String,
    #[prost(uint32, tag = "9")]
    pub attempts: u32,
    #[prost(uint32, tag = "10")]
    pub max_attempts: u32,
    #[prost(int64, tag = "11")]
    pub next_retry_at_unix: i64,
    #[prost(string, tag = "12")]
    pub last_action: String,
    #[prost(string, tag = "13")]
    pub last_error: String,
    #[prost(string, repeated, tag = "14")]
    pub logs: Vec<String>,
    #[prost(message, optional, tag = "15")]
    pub resources: Option<Resources>,
    #[prost(map = "string, string", tag = "16")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListWorkloadsRequest {
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(string, tag = "3")]
    pub desired_state: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListWorkloadsResponse {
    #[prost(message, repeated, tag = "1")]
    pub workloads: Vec<WorkloadInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetWorkloadRequest {
    #[prost(string, tag = "1")]
    pub workload_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetWorkloadResponse {
    #[prost(message, optional, tag = "1")]
    pub workload: Option<WorkloadInfo>,
}

// =============================================================================
// Cluster
// =============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetClusterSummaryRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetClusterSummaryResponse {
    #[prost(uint32, tag = "1")]
    pub total_nodes: u32,
    #[prost(uint32, tag = "2")]
    pub ready_nodes: u32,
    #[prost(uint32, tag = "3")]
    pub total_workloads: u32,
    #[prost(map = "string, uint32", tag = "4")]
    pub workloads_by_status: HashMap<String, u32>,
    #[prost(map = "string, uint32", tag = "5")]
    pub workloads_by_desired_state: HashMap<String, u32>,
    #[prost(uint64, tag = "6")]
    pub total_cpu_millicores: u64,
    #[prost(uint64, tag = "7")]
    pub available_cpu_millicores: u64,
    #[prost(uint64, tag = "8")]
    pub total_memory_mb: u64,
    #[prost(uint64, tag = "9")]
    pub available_memory_mb: u64,
    /// `normal`, `degraded` or `recovery`.
    #[prost(string, tag = "10")]
    pub mode: String,
}

/// Frame on the reserved bidirectional control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlMessage {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub kind: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}
