//! Scheduler event record - the append-only unit under `/events/`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EventError, EventType};

/// A control-plane event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    /// Unique event identifier (also the store key suffix).
    pub id: Uuid,

    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Human-readable cause.
    pub reason: String,

    /// Event-specific key/value details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,

    pub timestamp: DateTime<Utc>,
}

impl SchedulerEvent {
    /// Creates a new event builder.
    pub fn builder(event_type: EventType) -> SchedulerEventBuilder {
        SchedulerEventBuilder::new(event_type)
    }
}

/// Builder for constructing scheduler events.
#[derive(Debug)]
pub struct SchedulerEventBuilder {
    event_type: EventType,
    id: Option<Uuid>,
    workload_id: Option<String>,
    node_id: Option<String>,
    reason: Option<String>,
    details: BTreeMap<String, String>,
    timestamp: Option<DateTime<Utc>>,
}

impl SchedulerEventBuilder {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            id: None,
            workload_id: None,
            node_id: None,
            reason: None,
            details: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn workload(mut self, workload_id: impl Into<String>) -> Self {
        self.workload_id = Some(workload_id.into());
        self
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Builds the event. A reason is required; id and timestamp default to
    /// a fresh UUIDv4 and now.
    pub fn build(self) -> Result<SchedulerEvent, EventError> {
        let reason = self.reason.ok_or(EventError::MissingField("reason"))?;
        Ok(SchedulerEvent {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            event_type: self.event_type,
            workload_id: self.workload_id,
            node_id: self.node_id,
            reason,
            details: self.details,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_reason() {
        let err = SchedulerEvent::builder(EventType::NodeLost)
            .node("n1")
            .build()
            .unwrap_err();
        assert!(matches!(err, EventError::MissingField("reason")));
    }

    #[test]
    fn test_event_json_shape() {
        let event = SchedulerEvent::builder(EventType::Rescheduled)
            .workload("w1")
            .node("n2")
            .reason("node n1 unavailable")
            .detail("previous_node", "n1")
            .build()
            .unwrap();

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Rescheduled");
        assert_eq!(json["workload_id"], "w1");
        assert_eq!(json["details"]["previous_node"], "n1");

        let decoded: SchedulerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let event = SchedulerEvent::builder(EventType::NodeRegistered)
            .node("n1")
            .reason("register")
            .build()
            .unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("workload_id").is_none());
        assert!(json.get("details").is_none());
    }
}
