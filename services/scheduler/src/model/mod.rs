//! Domain model persisted in the state store.

mod node;
mod records;
mod workload;

pub use node::{parse_endpoint, Node, NodeError, NodeStatus, StatusSource};
pub use records::{AssignmentRecord, DriftRecord, ReconciliationRecord, RetryRecord};
pub use workload::{
    generate_workload_id, ActualState, CloudInit, ComposeSpec, ContainerSpec, DesiredState,
    GitSource, ResourceRequirements, RetryState, SpecError, StatusInfo, VmDisk, VmNetwork, VmSpec,
    Workload, WorkloadMetadata, WorkloadSpec, WorkloadStatus, WorkloadType, MAX_LOG_LINES,
};

pub(crate) use workload::within;
