//! Side records kept next to workloads: assignments, reconciliation
//! outcomes, retry projections and drift findings.

use chrono::{DateTime, Utc};
use persys_events::DriftType;
use serde::{Deserialize, Serialize};

use super::Workload;

/// One per workload; rewritten on every rebind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub workload_id: String,
    pub node_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the latest reconcile attempt for a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub workload_id: String,
    pub action: String,
    pub success: bool,
    #[serde(default)]
    pub reason: String,
    pub attempted_at: DateTime<Utc>,
}

/// Projection of a workload's retry state under `/retries/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub workload_id: String,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RetryRecord {
    pub fn from_workload(workload: &Workload) -> Self {
        Self {
            workload_id: workload.id.clone(),
            attempts: workload.retry.attempts,
            max_attempts: workload.retry.max_attempts,
            next_retry_at: workload.retry.next_retry_at,
            last_error: workload.metadata.last_error.clone(),
        }
    }
}

/// Latest drift finding for a (node, workload) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftRecord {
    pub node_id: String,
    pub workload_id: String,
    pub drift_type: DriftType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_status: Option<String>,
    pub action: String,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub detected_at: DateTime<Utc>,
}
