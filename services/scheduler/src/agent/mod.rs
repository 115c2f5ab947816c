//! Outbound calls to node agents.
//!
//! The scheduler never keeps a connection to an agent: every call dials the
//! node's `grpc_endpoint`, issues one RPC under an operation-specific
//! deadline and drops the channel. [`AgentTransport`] is the seam the
//! reconciler, monitor and drift detector use, so tests can swap the gRPC
//! client for [`MockAgentTransport`].

mod error;
mod grpc;
mod mock;
pub mod translate;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::AgentError;
pub use grpc::GrpcAgentTransport;
pub use mock::{AgentCall, HostedWorkload, MockAgentTransport};

use crate::model::{ActualState, DesiredState, Node, Workload};

/// Accepted apply. Rejections come back as [`AgentError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub applied: bool,
    pub skipped: bool,
    pub message: String,
    pub status: Option<AgentWorkloadStatus>,
}

/// A workload as the agent sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentWorkloadStatus {
    pub id: String,
    pub actual_state: ActualState,
    pub revision_id: Option<String>,
    pub message: Option<String>,
}

/// One entry of the agent's action history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentAction {
    pub id: String,
    pub workload_id: String,
    pub action: String,
    pub status: String,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl AgentAction {
    /// Single log line for the workload buffer.
    pub fn log_line(&self) -> String {
        let at = self
            .timestamp
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        if self.message.is_empty() {
            format!("[agent {at}] {} {}", self.action, self.status)
        } else {
            format!("[agent {at}] {} {}: {}", self.action, self.status, self.message)
        }
    }
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Push `desired` for `workload` to `node`. Returns `Ok` only when the
    /// agent applied or skipped the request.
    async fn apply_workload(
        &self,
        node: &Node,
        workload: &Workload,
        desired: DesiredState,
    ) -> Result<ApplyResult, AgentError>;

    /// [`AgentError::NotFound`] when the agent has no record of the workload.
    async fn get_workload_status(
        &self,
        node: &Node,
        workload_id: &str,
    ) -> Result<AgentWorkloadStatus, AgentError>;

    /// Returns false when the agent did not know the workload.
    async fn delete_workload(&self, node: &Node, workload_id: &str) -> Result<bool, AgentError>;

    async fn list_workloads(&self, node: &Node) -> Result<Vec<AgentWorkloadStatus>, AgentError>;

    async fn list_actions(
        &self,
        node: &Node,
        workload_id: &str,
        newest_first: bool,
        limit: u32,
    ) -> Result<Vec<AgentAction>, AgentError>;
}
