//! Typed agent failures.

use std::time::Duration;

use persys_proto::agent::v1 as proto;
use tonic::Code;

use crate::model::WorkloadType;

const RUNTIME_UNAVAILABLE_MARKER: &str = "runtime not available";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// The agent has no record of the workload. Authoritative for deletion.
    #[error("workload {0} not found on agent")]
    NotFound(String),

    #[error("agent {endpoint} unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("agent {endpoint} did not answer within {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("agent rejected spec: {0}")]
    SpecRejected(String),

    #[error("runtime error ({category}): {message}")]
    Runtime { category: String, message: String },

    #[error("runtime not available for {workload_type}: {message}")]
    RuntimeUnavailable {
        workload_type: WorkloadType,
        message: String,
    },

    #[error("invalid agent endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("cannot translate workload: {0}")]
    Translation(String),
}

impl AgentError {
    /// Connection-level failures that say something about node health.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Metric label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Unreachable { .. } => "Unavailable",
            Self::Timeout { .. } => "DeadlineExceeded",
            Self::SpecRejected(_) => "InvalidArgument",
            Self::Runtime { .. } => "Internal",
            Self::RuntimeUnavailable { .. } => "FailedPrecondition",
            Self::InvalidEndpoint(_) | Self::Translation(_) => "Client",
        }
    }

    /// Failure category persisted as the workload's failure reason prefix.
    pub fn category(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unreachable { .. } | Self::Timeout { .. } => "unreachable",
            Self::SpecRejected(_) | Self::Translation(_) => "invalid_spec",
            Self::Runtime { category, .. } => category,
            Self::RuntimeUnavailable { .. } => "runtime_unavailable",
            Self::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }

    /// Classify a gRPC status returned by the agent.
    pub fn from_status(
        endpoint: &str,
        workload_id: &str,
        workload_type: Option<WorkloadType>,
        status: tonic::Status,
    ) -> Self {
        let message = status.message().to_string();
        if let Some(workload_type) = workload_type.filter(|_| mentions_runtime_unavailable(&message)) {
            return Self::RuntimeUnavailable {
                workload_type,
                message,
            };
        }
        match status.code() {
            Code::NotFound => Self::NotFound(workload_id.to_string()),
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => Self::Unreachable {
                endpoint: endpoint.to_string(),
                message,
            },
            Code::InvalidArgument => Self::SpecRejected(message),
            code => {
                if message.to_ascii_lowercase().contains("not found") {
                    Self::NotFound(workload_id.to_string())
                } else {
                    Self::Runtime {
                        category: format!("{code:?}").to_ascii_lowercase(),
                        message,
                    }
                }
            }
        }
    }

    /// Classify an apply response that was neither applied nor skipped.
    pub fn from_rejection(
        workload_type: WorkloadType,
        failure_reason: proto::FailureReason,
        message: String,
    ) -> Self {
        match failure_reason {
            proto::FailureReason::InvalidSpec => Self::SpecRejected(message),
            proto::FailureReason::RuntimeUnavailable => Self::RuntimeUnavailable {
                workload_type,
                message,
            },
            _ if mentions_runtime_unavailable(&message) => Self::RuntimeUnavailable {
                workload_type,
                message,
            },
            _ => Self::Runtime {
                category: "apply".to_string(),
                message: if message.is_empty() {
                    "agent neither applied nor skipped the workload".to_string()
                } else {
                    message
                },
            },
        }
    }
}

fn mentions_runtime_unavailable(message: &str) -> bool {
    message.to_ascii_lowercase().contains(RUNTIME_UNAVAILABLE_MARKER)
}
