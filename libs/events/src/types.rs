//! Event and drift type definitions.

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Kinds of control-plane events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A workload was bound to a node for the first time.
    WorkloadScheduled,
    /// A workload exhausted its retry budget.
    WorkloadFailed,
    /// A failed action was scheduled for another attempt.
    RetryTriggered,
    /// A workload was moved off an unavailable or incapable node.
    Rescheduled,
    /// The scheduler's view and an agent's view disagreed.
    DriftDetected,
    /// A node stopped heartbeating or became unreachable.
    NodeLost,
    NodeRegistered,
    NodeRemoved,
    /// A workload record was finalized and purged.
    WorkloadDeleted,
    /// A node reported a runtime as unavailable and lost that capability.
    CapabilityDowngraded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkloadScheduled => "WorkloadScheduled",
            Self::WorkloadFailed => "WorkloadFailed",
            Self::RetryTriggered => "RetryTriggered",
            Self::Rescheduled => "Rescheduled",
            Self::DriftDetected => "DriftDetected",
            Self::NodeLost => "NodeLost",
            Self::NodeRegistered => "NodeRegistered",
            Self::NodeRemoved => "NodeRemoved",
            Self::WorkloadDeleted => "WorkloadDeleted",
            Self::CapabilityDowngraded => "CapabilityDowngraded",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "WorkloadScheduled" => Self::WorkloadScheduled,
            "WorkloadFailed" => Self::WorkloadFailed,
            "RetryTriggered" => Self::RetryTriggered,
            "Rescheduled" => Self::Rescheduled,
            "DriftDetected" => Self::DriftDetected,
            "NodeLost" => Self::NodeLost,
            "NodeRegistered" => Self::NodeRegistered,
            "NodeRemoved" => Self::NodeRemoved,
            "WorkloadDeleted" => Self::WorkloadDeleted,
            "CapabilityDowngraded" => Self::CapabilityDowngraded,
            other => return Err(EventError::UnknownEventType(other.to_string())),
        };
        Ok(ty)
    }
}

/// Classification of a disagreement between scheduler and agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    /// The agent hosts a workload the scheduler does not assign to it.
    OrphanOnAgent,
    /// The scheduler assigns a workload the agent does not host.
    MissingOnAgent,
    StateMismatch,
    RevisionMismatch,
}

impl DriftType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrphanOnAgent => "orphan_on_agent",
            Self::MissingOnAgent => "missing_on_agent",
            Self::StateMismatch => "state_mismatch",
            Self::RevisionMismatch => "revision_mismatch",
        }
    }
}

impl std::fmt::Display for DriftType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for ty in [
            EventType::WorkloadScheduled,
            EventType::WorkloadFailed,
            EventType::RetryTriggered,
            EventType::Rescheduled,
            EventType::DriftDetected,
            EventType::NodeLost,
            EventType::NodeRegistered,
            EventType::NodeRemoved,
            EventType::WorkloadDeleted,
            EventType::CapabilityDowngraded,
        ] {
            let parsed: EventType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, ty);
        }
        assert!("Bogus".parse::<EventType>().is_err());
    }

    #[test]
    fn test_drift_type_serializes_snake_case() {
        let json = serde_json::to_string(&DriftType::OrphanOnAgent).unwrap();
        assert_eq!(json, "\"orphan_on_agent\"");
        assert_eq!(DriftType::RevisionMismatch.to_string(), "revision_mismatch");
    }
}
