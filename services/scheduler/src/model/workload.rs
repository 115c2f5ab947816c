//! Workload records: spec, intent, observed status, retry and audit metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use persys_reconcile::RevisionId;
use serde::{Deserialize, Serialize};

/// Lines kept in a workload's log buffer; older lines are dropped first.
pub const MAX_LOG_LINES: usize = 200;

/// Canonical workload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    Container,
    Compose,
    Vm,
}

impl WorkloadType {
    /// Map a user-facing type name or legacy alias to its canonical type.
    pub fn canonicalize(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "container" | "docker-container" | "docker" => Some(Self::Container),
            "compose" | "docker-compose" => Some(Self::Compose),
            "vm" | "virtual-machine" | "virtualmachine" => Some(Self::Vm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Compose => "compose",
            Self::Vm => "vm",
        }
    }
}

impl std::fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
    Deleted,
}

impl DesiredState {
    /// Case-insensitive parse; unknown or empty values mean Running.
    pub fn canonicalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stopped" | "stop" => Self::Stopped,
            "deleted" | "delete" => Self::Deleted,
            _ => Self::Running,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Deleted => "Deleted",
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler-side lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadStatus {
    Pending,
    Scheduled,
    Running,
    Stopped,
    Failed,
    Deleting,
    Deleted,
    RetryPending,
    Updating,
    Unknown,
    Completed,
}

impl WorkloadStatus {
    pub const ALL: [WorkloadStatus; 11] = [
        Self::Pending,
        Self::Scheduled,
        Self::Running,
        Self::Stopped,
        Self::Failed,
        Self::Deleting,
        Self::Deleted,
        Self::RetryPending,
        Self::Updating,
        Self::Unknown,
        Self::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
            Self::Deleting => "Deleting",
            Self::Deleted => "Deleted",
            Self::RetryPending => "RetryPending",
            Self::Updating => "Updating",
            Self::Unknown => "Unknown",
            Self::Completed => "Completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// Statuses that mirror an agent observation rather than scheduler
    /// bookkeeping.
    pub fn is_observed(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Scheduled | Self::Running | Self::Stopped | Self::Failed | Self::Unknown
        )
    }
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State observed on the agent. `Missing` means the agent has no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActualState {
    Pending,
    Running,
    Stopped,
    Failed,
    Unknown,
    Missing,
}

impl ActualState {
    /// Parse the agent's upper-case state name (`RUNNING`, ...).
    pub fn from_agent(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "STOPPED" => Self::Stopped,
            "FAILED" => Self::Failed,
            "MISSING" => Self::Missing,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
            Self::Missing => "Missing",
        }
    }

    /// Scheduler status mirroring this observation.
    pub fn to_status(self) -> WorkloadStatus {
        match self {
            Self::Pending | Self::Missing => WorkloadStatus::Pending,
            Self::Running => WorkloadStatus::Running,
            Self::Stopped => WorkloadStatus::Stopped,
            Self::Failed => WorkloadStatus::Failed,
            Self::Unknown => WorkloadStatus::Unknown,
        }
    }

    /// Whether this observation satisfies `desired`.
    pub fn satisfies(self, desired: DesiredState) -> bool {
        matches!(
            (desired, self),
            (DesiredState::Running, Self::Running)
                | (DesiredState::Stopped, Self::Stopped)
                | (DesiredState::Deleted, Self::Missing)
        )
    }
}

impl std::fmt::Display for ActualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub cpu_millicores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_gb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// `host:container[/proto]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// `host:container[:ro]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

/// Where a compose project comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Compose file path inside the repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeSpec {
    #[serde(default)]
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDisk {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub size_gb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmNetwork {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub disks: Vec<VmDisk>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<VmNetwork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,
}

/// Why a submitted spec is not acceptable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("unknown workload type {0:?}")]
    UnknownType(String),

    #[error("{0} workload is missing its {0} spec")]
    MissingSubspec(WorkloadType),

    #[error("container image must not be empty")]
    EmptyImage,

    #[error("compose workload needs compose_yaml or a git repository")]
    MissingComposeSource,

    #[error("vm needs at least one vcpu and non-zero memory")]
    VmShape,

    #[error("invalid port mapping {0:?}")]
    InvalidPort(String),

    #[error("invalid volume mount {0:?}")]
    InvalidVolume(String),
}

/// The part of a workload that determines its revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    #[serde(rename = "type")]
    pub workload_type: WorkloadType,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<ComposeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmSpec>,
    /// Label selector: every pair must be present on the target node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl WorkloadSpec {
    pub fn container(spec: ContainerSpec) -> Self {
        Self {
            workload_type: WorkloadType::Container,
            resources: ResourceRequirements::default(),
            container: Some(spec),
            compose: None,
            vm: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Check that the payload matching the type is present and well formed.
    pub fn validate(&self) -> Result<(), SpecError> {
        match self.workload_type {
            WorkloadType::Container => {
                let spec = self
                    .container
                    .as_ref()
                    .ok_or(SpecError::MissingSubspec(WorkloadType::Container))?;
                if spec.image.trim().is_empty() {
                    return Err(SpecError::EmptyImage);
                }
                for port in &spec.ports {
                    crate::agent::translate::parse_port_mapping(port)?;
                }
                for volume in &spec.volumes {
                    crate::agent::translate::parse_volume(volume)?;
                }
            }
            WorkloadType::Compose => {
                let spec = self
                    .compose
                    .as_ref()
                    .ok_or(SpecError::MissingSubspec(WorkloadType::Compose))?;
                let has_yaml = spec.compose_yaml.as_deref().is_some_and(|y| !y.trim().is_empty());
                let has_git = spec.git.as_ref().is_some_and(|g| !g.repo_url.trim().is_empty());
                if !has_yaml && !has_git {
                    return Err(SpecError::MissingComposeSource);
                }
            }
            WorkloadType::Vm => {
                let spec = self
                    .vm
                    .as_ref()
                    .ok_or(SpecError::MissingSubspec(WorkloadType::Vm))?;
                if spec.vcpus == 0 || spec.memory_mb == 0 {
                    return Err(SpecError::VmShape);
                }
            }
        }
        Ok(())
    }

    /// Deterministic digest of this spec.
    pub fn revision_id(&self) -> RevisionId {
        let json = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        RevisionId::from_json(&json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_state: Option<ActualState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
            next_retry_at: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_retry_at = None;
    }
}

/// Typed audit breadcrumbs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_launch_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciliation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciliation_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciliation_success: Option<bool>,
    /// Free-form extension keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// The persisted workload record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub revision_id: String,
    pub spec: WorkloadSpec,
    pub desired_state: DesiredState,
    pub status: WorkloadStatus,
    pub status_info: StatusInfo,
    /// Authoritative assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Mirror of `node_id` kept for older readers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node: Option<String>,
    pub retry: RetryState,
    #[serde(default)]
    pub metadata: WorkloadMetadata,
    #[serde(default)]
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workload {
    pub fn new(
        id: impl Into<String>,
        spec: WorkloadSpec,
        desired_state: DesiredState,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let revision_id = spec.revision_id().into_string();
        Self {
            id: id.into(),
            revision_id,
            spec,
            desired_state,
            status: WorkloadStatus::Pending,
            status_info: StatusInfo {
                actual_state: None,
                failure_reason: None,
                last_updated: now,
            },
            node_id: None,
            assigned_node: None,
            retry: RetryState::new(max_attempts),
            metadata: WorkloadMetadata::default(),
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn workload_type(&self) -> WorkloadType {
        self.spec.workload_type
    }

    /// Replace spec and intent. Returns true when anything changed.
    ///
    /// A spec change regenerates the revision, clears the retry budget and
    /// marks an assigned workload `Updating`.
    pub fn update(&mut self, spec: WorkloadSpec, desired_state: DesiredState, now: DateTime<Utc>) -> bool {
        let revision = spec.revision_id().into_string();
        let spec_changed = revision != self.revision_id;
        let intent_changed = desired_state != self.desired_state;
        if !spec_changed && !intent_changed {
            return false;
        }

        self.spec = spec;
        self.revision_id = revision;
        self.desired_state = desired_state;
        self.retry.reset();
        self.status_info.failure_reason = None;
        if spec_changed && self.node_id.is_some() && desired_state != DesiredState::Deleted {
            self.set_status(WorkloadStatus::Updating, now);
        } else if self.status == WorkloadStatus::Failed {
            self.set_status(WorkloadStatus::Pending, now);
        }
        self.touch(now);
        true
    }

    /// Recompute the revision if it was never set.
    pub fn ensure_revision(&mut self) -> &str {
        if self.revision_id.is_empty() {
            self.revision_id = self.spec.revision_id().into_string();
        }
        &self.revision_id
    }

    pub fn assign(&mut self, node_id: &str, now: DateTime<Utc>) {
        if let Some(previous) = self.node_id.as_deref().filter(|p| *p != node_id) {
            self.metadata.previous_node = Some(previous.to_string());
        }
        self.node_id = Some(node_id.to_string());
        self.assigned_node = Some(node_id.to_string());
        self.touch(now);
    }

    pub fn clear_assignment(&mut self, now: DateTime<Utc>) {
        if let Some(previous) = self.node_id.take() {
            self.metadata.previous_node = Some(previous);
        }
        self.assigned_node = None;
        self.touch(now);
    }

    pub fn set_status(&mut self, status: WorkloadStatus, now: DateTime<Utc>) {
        self.status = status;
        self.status_info.last_updated = now;
        self.touch(now);
    }

    pub fn append_log(&mut self, line: impl Into<String>) {
        let line = line.into();
        if line.is_empty() {
            return;
        }
        self.logs.push(line);
        if self.logs.len() > MAX_LOG_LINES {
            let excess = self.logs.len() - MAX_LOG_LINES;
            self.logs.drain(..excess);
        }
    }

    /// Whether a launch happened within `window` of `now`.
    pub fn launched_within(&self, window: std::time::Duration, now: DateTime<Utc>) -> bool {
        within(self.metadata.last_launch_time, window, now)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// `at` is set and no older than `window`.
pub(crate) fn within(at: Option<DateTime<Utc>>, window: std::time::Duration, now: DateTime<Utc>) -> bool {
    let Some(at) = at else {
        return false;
    };
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now.signed_duration_since(at) <= window
}

/// Generated id for workloads submitted without one.
pub fn generate_workload_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("wl-{}", &raw[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn alpine() -> WorkloadSpec {
        WorkloadSpec::container(ContainerSpec {
            image: "alpine:latest".to_string(),
            ..Default::default()
        })
    }

    #[rstest]
    #[case("container", Some(WorkloadType::Container))]
    #[case("docker-container", Some(WorkloadType::Container))]
    #[case("Docker-Compose", Some(WorkloadType::Compose))]
    #[case("vm", Some(WorkloadType::Vm))]
    #[case("lambda", None)]
    fn test_canonical_type(#[case] raw: &str, #[case] expected: Option<WorkloadType>) {
        assert_eq!(WorkloadType::canonicalize(raw), expected);
    }

    #[rstest]
    #[case("running", DesiredState::Running)]
    #[case("STOPPED", DesiredState::Stopped)]
    #[case("Deleted", DesiredState::Deleted)]
    #[case("", DesiredState::Running)]
    #[case("paused", DesiredState::Running)]
    fn test_desired_state_defaults_to_running(#[case] raw: &str, #[case] expected: DesiredState) {
        assert_eq!(DesiredState::canonicalize(raw), expected);
    }

    #[test]
    fn test_revision_stable_across_serialization() {
        let now = Utc::now();
        let workload = Workload::new("w1", alpine(), DesiredState::Running, 5, now);
        let json = serde_json::to_string(&workload).unwrap();
        let decoded: Workload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.spec.revision_id().as_str(), workload.revision_id);
        assert_eq!(decoded, workload);
    }

    #[test]
    fn test_update_regenerates_revision() {
        let now = Utc::now();
        let mut workload = Workload::new("w1", alpine(), DesiredState::Running, 5, now);
        workload.assign("n1", now);
        let before = workload.revision_id.clone();

        assert!(!workload.update(alpine(), DesiredState::Running, now));

        let mut spec = alpine();
        spec.container.as_mut().unwrap().image = "alpine:3.20".to_string();
        assert!(workload.update(spec, DesiredState::Running, now));
        assert_ne!(workload.revision_id, before);
        assert_eq!(workload.status, WorkloadStatus::Updating);
    }

    #[test]
    fn test_intent_only_update_keeps_revision() {
        let now = Utc::now();
        let mut workload = Workload::new("w1", alpine(), DesiredState::Running, 5, now);
        let before = workload.revision_id.clone();
        assert!(workload.update(alpine(), DesiredState::Stopped, now));
        assert_eq!(workload.revision_id, before);
        assert_eq!(workload.desired_state, DesiredState::Stopped);
    }

    #[test]
    fn test_validate_rejects_missing_payload() {
        let mut spec = alpine();
        spec.container = None;
        assert_eq!(
            spec.validate(),
            Err(SpecError::MissingSubspec(WorkloadType::Container))
        );

        let compose = WorkloadSpec {
            workload_type: WorkloadType::Compose,
            compose: Some(ComposeSpec::default()),
            ..alpine()
        };
        assert_eq!(compose.validate(), Err(SpecError::MissingComposeSource));
    }

    #[test]
    fn test_validate_rejects_bad_port() {
        let mut spec = alpine();
        spec.container.as_mut().unwrap().ports = vec!["eighty".to_string()];
        assert!(matches!(spec.validate(), Err(SpecError::InvalidPort(_))));
    }

    #[test]
    fn test_log_buffer_is_capped() {
        let mut workload = Workload::new("w1", alpine(), DesiredState::Running, 5, Utc::now());
        for i in 0..(MAX_LOG_LINES + 10) {
            workload.append_log(format!("line {i}"));
        }
        assert_eq!(workload.logs.len(), MAX_LOG_LINES);
        assert_eq!(workload.logs[0], "line 10");
    }

    #[test]
    fn test_assign_tracks_previous_node() {
        let now = Utc::now();
        let mut workload = Workload::new("w1", alpine(), DesiredState::Running, 5, now);
        workload.assign("n1", now);
        workload.assign("n2", now);
        assert_eq!(workload.node_id.as_deref(), Some("n2"));
        assert_eq!(workload.assigned_node.as_deref(), Some("n2"));
        assert_eq!(workload.metadata.previous_node.as_deref(), Some("n1"));
    }

    #[test]
    fn test_generated_id_shape() {
        let id = generate_workload_id();
        assert!(id.starts_with("wl-"));
        assert_eq!(id.len(), 15);
    }

    #[test]
    fn test_actual_state_mapping() {
        assert_eq!(ActualState::from_agent("RUNNING").to_status(), WorkloadStatus::Running);
        assert_eq!(ActualState::from_agent("bogus"), ActualState::Unknown);
        assert!(ActualState::Stopped.satisfies(DesiredState::Stopped));
        assert!(!ActualState::Pending.satisfies(DesiredState::Running));
    }
}
