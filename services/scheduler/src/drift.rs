//! Drift detection between the scheduler's view and what agents run.
//!
//! Each pass lists every ready agent's workloads and compares them with the
//! assignments in the store. Findings are persisted under
//! `/drift/<node>/<workload>` and emitted as `DriftDetected` events. Outside
//! normal mode findings are only logged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use persys_events::{DriftType, EventType, SchedulerEvent};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentTransport, AgentWorkloadStatus};
use crate::metrics::SchedulerMetrics;
use crate::model::{AssignmentRecord, DesiredState, DriftRecord, Node, Workload, WorkloadStatus};
use crate::scheduler::ReconcileHandle;
use crate::store::{StateStore, StoreError};

/// Remediation chosen for a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAction {
    DeleteOnAgent,
    Adopt,
    Rebind,
    FailoverAdopt,
    DeleteDuplicate,
    Investigate,
    AlignStatus,
    Reapply,
    Retry,
}

impl DriftAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeleteOnAgent => "delete_on_agent",
            Self::Adopt => "adopt",
            Self::Rebind => "rebind",
            Self::FailoverAdopt => "failover_adopt",
            Self::DeleteDuplicate => "delete_duplicate",
            Self::Investigate => "investigate",
            Self::AlignStatus => "align_status",
            Self::Reapply => "reapply",
            Self::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftFinding {
    pub node_id: String,
    pub workload_id: String,
    pub drift_type: DriftType,
    pub scheduler_status: Option<String>,
    pub agent_status: Option<String>,
    pub action: DriftAction,
    pub resolved: bool,
    pub last_error: Option<String>,
}

impl DriftFinding {
    fn new(node: &Node, workload_id: &str, drift_type: DriftType, action: DriftAction) -> Self {
        Self {
            node_id: node.node_id.clone(),
            workload_id: workload_id.to_string(),
            drift_type,
            scheduler_status: None,
            agent_status: None,
            action,
            resolved: false,
            last_error: None,
        }
    }

    fn record(&self, at: DateTime<Utc>) -> DriftRecord {
        DriftRecord {
            node_id: self.node_id.clone(),
            workload_id: self.workload_id.clone(),
            drift_type: self.drift_type,
            scheduler_status: self.scheduler_status.clone(),
            agent_status: self.agent_status.clone(),
            action: self.action.as_str().to_string(),
            resolved: self.resolved,
            last_error: self.last_error.clone(),
            detected_at: at,
        }
    }
}

/// Ready nodes, one per agent endpoint. When node records share an endpoint
/// the one with the latest heartbeat wins.
pub fn dedupe_by_endpoint(nodes: &[Node]) -> Vec<Node> {
    let mut by_endpoint: BTreeMap<&str, &Node> = BTreeMap::new();
    for node in nodes.iter().filter(|n| n.is_ready()) {
        by_endpoint
            .entry(node.grpc_endpoint.as_str())
            .and_modify(|kept| {
                if node.last_heartbeat > kept.last_heartbeat {
                    *kept = node;
                }
            })
            .or_insert(node);
    }
    let mut kept: Vec<Node> = by_endpoint.into_values().cloned().collect();
    kept.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    kept
}

/// Everything one pass needs to know about the scheduler's side.
struct View {
    nodes: HashMap<String, Node>,
    workloads: HashMap<String, Workload>,
}

impl View {
    fn expected_on(&self, node_id: &str) -> BTreeMap<&str, &Workload> {
        self.workloads
            .values()
            .filter(|w| w.node_id.as_deref() == Some(node_id) && w.status != WorkloadStatus::Deleted)
            .map(|w| (w.id.as_str(), w))
            .collect()
    }
}

pub struct DriftDetector {
    store: StateStore,
    agent: Arc<dyn AgentTransport>,
    reconcile: ReconcileHandle,
    metrics: Arc<SchedulerMetrics>,
    interval: Duration,
    /// Owners silent for longer than this are treated as unhealthy.
    unavailable_grace: Duration,
}

impl DriftDetector {
    pub fn new(
        store: StateStore,
        agent: Arc<dyn AgentTransport>,
        reconcile: ReconcileHandle,
        metrics: Arc<SchedulerMetrics>,
        interval: Duration,
        unavailable_grace: Duration,
    ) -> Self {
        Self {
            store,
            agent,
            reconcile,
            metrics,
            interval,
            unavailable_grace,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting drift detector");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.detect_once().await {
                        error!(error = %e, "Drift detection failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Drift detector shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn snapshot(&self) -> Result<View, StoreError> {
        Ok(View {
            nodes: self
                .store
                .list_nodes()
                .await?
                .into_iter()
                .map(|n| (n.node_id.clone(), n))
                .collect(),
            workloads: self
                .store
                .list_workloads()
                .await?
                .into_iter()
                .map(|w| (w.id.clone(), w))
                .collect(),
        })
    }

    /// One comparison pass over every ready agent.
    #[instrument(skip(self))]
    pub async fn detect_once(&self) -> Result<Vec<DriftFinding>, StoreError> {
        let remediate = self.store.mode().writes_allowed();
        let view = self.snapshot().await?;
        let all_nodes: Vec<Node> = view.nodes.values().cloned().collect();

        let mut findings = Vec::new();
        for node in dedupe_by_endpoint(&all_nodes) {
            let reported = match self.agent.list_workloads(&node).await {
                Ok(reported) => reported,
                Err(e) => {
                    warn!(node_id = %node.node_id, error = %e, "Cannot list agent workloads");
                    continue;
                }
            };
            findings.extend(self.compare(&view, &node, reported));
        }

        let now = Utc::now();
        for finding in &mut findings {
            if remediate {
                self.remediate(&view, finding).await?;
                self.store.put_drift(&finding.record(now)).await?;
                self.store
                    .record_event(
                        SchedulerEvent::builder(EventType::DriftDetected)
                            .node(finding.node_id.clone())
                            .workload(finding.workload_id.clone())
                            .reason(finding.drift_type.as_str())
                            .detail("action", finding.action.as_str())
                            .detail("resolved", finding.resolved.to_string())
                            .timestamp(now),
                    )
                    .await;
            }
            self.metrics
                .record_drift(finding.drift_type.as_str(), finding.action.as_str());
            warn!(
                node_id = %finding.node_id,
                workload_id = %finding.workload_id,
                drift_type = finding.drift_type.as_str(),
                action = finding.action.as_str(),
                resolved = finding.resolved,
                remediated = remediate,
                "Drift detected"
            );
        }
        Ok(findings)
    }

    fn compare(&self, view: &View, node: &Node, reported: Vec<AgentWorkloadStatus>) -> Vec<DriftFinding> {
        let expected = view.expected_on(&node.node_id);
        let mut findings = Vec::new();
        let mut seen = Vec::with_capacity(reported.len());

        for status in reported {
            seen.push(status.id.clone());
            let Some(workload) = expected.get(status.id.as_str()) else {
                let mut finding = self.classify_orphan(view, node, &status);
                finding.agent_status = Some(status.actual_state.as_str().to_string());
                finding.scheduler_status = view
                    .workloads
                    .get(&status.id)
                    .map(|w| w.status.as_str().to_string());
                findings.push(finding);
                continue;
            };
            if workload.desired_state == DesiredState::Deleted {
                // the reconciler is already deleting it
                continue;
            }

            let revision_differs = status
                .revision_id
                .as_deref()
                .is_some_and(|r| !workload.revision_id.is_empty() && r != workload.revision_id);
            let agent_status = status.actual_state.to_status();
            let finding = if revision_differs {
                Some(DriftFinding::new(node, &workload.id, DriftType::RevisionMismatch, DriftAction::Reapply))
            } else if workload.status.is_observed() && workload.status != agent_status {
                Some(DriftFinding::new(node, &workload.id, DriftType::StateMismatch, DriftAction::AlignStatus))
            } else {
                None
            };
            if let Some(mut finding) = finding {
                finding.scheduler_status = Some(workload.status.as_str().to_string());
                finding.agent_status = Some(status.actual_state.as_str().to_string());
                findings.push(finding);
            }
        }

        for (id, workload) in expected {
            if seen.iter().any(|s| s == id) || workload.desired_state == DesiredState::Deleted {
                continue;
            }
            let mut finding = DriftFinding::new(node, id, DriftType::MissingOnAgent, DriftAction::Retry);
            finding.scheduler_status = Some(workload.status.as_str().to_string());
            findings.push(finding);
        }
        findings
    }

    fn classify_orphan(&self, view: &View, node: &Node, status: &AgentWorkloadStatus) -> DriftFinding {
        let orphan = |action| DriftFinding::new(node, &status.id, DriftType::OrphanOnAgent, action);
        let Some(workload) = view.workloads.get(&status.id) else {
            return orphan(DriftAction::DeleteOnAgent);
        };
        if workload.desired_state == DesiredState::Deleted {
            return orphan(DriftAction::DeleteOnAgent);
        }
        let owner_id = match workload.node_id.as_deref() {
            None => return orphan(DriftAction::Adopt),
            Some(owner) if owner == node.node_id => return orphan(DriftAction::Adopt),
            Some(owner) => owner,
        };
        match view.nodes.get(owner_id) {
            Some(owner) if owner.grpc_endpoint == node.grpc_endpoint => orphan(DriftAction::Rebind),
            Some(owner) if owner.is_ready() && !owner.heartbeat_older_than(self.unavailable_grace, Utc::now()) => {
                // resolved against the owner's agent during remediation
                orphan(DriftAction::DeleteDuplicate)
            }
            _ => orphan(DriftAction::FailoverAdopt),
        }
    }

    async fn remediate(&self, view: &View, finding: &mut DriftFinding) -> Result<(), StoreError> {
        let Some(node) = view.nodes.get(&finding.node_id) else {
            return Ok(());
        };
        let now = Utc::now();

        match finding.action {
            DriftAction::DeleteOnAgent => {
                let created_since = !view.workloads.contains_key(&finding.workload_id)
                    && self.store.get_workload(&finding.workload_id).await?.is_some();
                if created_since {
                    skip_stale(finding);
                    return Ok(());
                }
                self.delete_on_agent(node, finding).await;
            }
            DriftAction::DeleteDuplicate => {
                let owner = view
                    .workloads
                    .get(&finding.workload_id)
                    .and_then(|w| w.node_id.as_deref())
                    .and_then(|id| view.nodes.get(id));
                let owner_has_it = match owner {
                    Some(owner) => self
                        .agent
                        .get_workload_status(owner, &finding.workload_id)
                        .await
                        .is_ok(),
                    None => false,
                };
                if owner_has_it {
                    self.delete_on_agent(node, finding).await;
                } else {
                    finding.action = DriftAction::Investigate;
                    warn!(
                        node_id = %node.node_id,
                        workload_id = %finding.workload_id,
                        "Workload runs on an unexpected node; leaving it for an operator"
                    );
                }
            }
            DriftAction::Adopt | DriftAction::Rebind | DriftAction::FailoverAdopt => {
                let Some(mut workload) = self.unchanged_workload(view, finding).await? else {
                    return Ok(());
                };
                let reason = match finding.action {
                    DriftAction::Adopt => "missing_or_stale_assignment".to_string(),
                    DriftAction::Rebind => format!(
                        "node id rotated from {}",
                        workload.node_id.as_deref().unwrap_or_default()
                    ),
                    _ => format!(
                        "owner {} unavailable",
                        workload.node_id.as_deref().unwrap_or_default()
                    ),
                };
                workload.assign(&node.node_id, now);
                workload.append_log(format!("adopted by {}: {reason}", node.node_id));
                self.store.put_workload(&workload).await?;
                self.store
                    .put_assignment(&AssignmentRecord {
                        workload_id: workload.id.clone(),
                        node_id: node.node_id.clone(),
                        reason: format!("drift: {reason}"),
                        created_at: now,
                    })
                    .await?;
                info!(node_id = %node.node_id, workload_id = %workload.id, reason = %reason, "Adopted orphan workload");
                finding.resolved = true;
                self.reconcile.trigger(&workload.id);
            }
            DriftAction::AlignStatus => {
                let Some(mut workload) = self.unchanged_workload(view, finding).await? else {
                    return Ok(());
                };
                let Some(state) = finding.agent_status.as_deref().map(crate::model::ActualState::from_agent) else {
                    return Ok(());
                };
                workload.status_info.actual_state = Some(state);
                workload.set_status(state.to_status(), now);
                self.store.put_workload(&workload).await?;
                finding.resolved = true;
            }
            DriftAction::Reapply => {
                let Some(mut workload) = self.unchanged_workload(view, finding).await? else {
                    return Ok(());
                };
                workload.set_status(WorkloadStatus::Updating, now);
                self.store.put_workload(&workload).await?;
                self.reconcile.trigger(&workload.id);
            }
            DriftAction::Retry => {
                let Some(mut workload) = self.unchanged_workload(view, finding).await? else {
                    return Ok(());
                };
                workload.retry.next_retry_at = Some(now);
                workload.append_log(format!("agent on {} lost the workload", node.node_id));
                workload.touch(now);
                self.store.put_workload(&workload).await?;
                self.reconcile.trigger(&workload.id);
            }
            DriftAction::Investigate => {}
        }
        Ok(())
    }

    /// The stored workload, unless something wrote it after the pass took
    /// its snapshot. Stale findings are left for the next pass.
    async fn unchanged_workload(&self, view: &View, finding: &mut DriftFinding) -> Result<Option<Workload>, StoreError> {
        let Some(seen) = view.workloads.get(&finding.workload_id) else {
            return Ok(None);
        };
        match self.store.get_workload(&finding.workload_id).await? {
            Some(current) if current.updated_at == seen.updated_at && current.revision_id == seen.revision_id => {
                Ok(Some(current))
            }
            _ => {
                skip_stale(finding);
                Ok(None)
            }
        }
    }

    async fn delete_on_agent(&self, node: &Node, finding: &mut DriftFinding) {
        match self.agent.delete_workload(node, &finding.workload_id).await {
            Ok(_) => {
                debug!(node_id = %node.node_id, workload_id = %finding.workload_id, "Deleted drifted workload on agent");
                finding.resolved = true;
            }
            Err(e) => finding.last_error = Some(e.to_string()),
        }
    }
}

fn skip_stale(finding: &mut DriftFinding) {
    debug!(
        node_id = %finding.node_id,
        workload_id = %finding.workload_id,
        "Workload changed during drift pass; skipping remediation"
    );
    finding.last_error = Some("workload changed during drift pass".to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentTransport;
    use crate::mode::ModeController;
    use crate::model::{ActualState, ContainerSpec, WorkloadSpec};
    use crate::store::{ClusterCache, MemoryBackend, RetryPolicy};

    #[test]
    fn test_dedupe_keeps_latest_heartbeat() {
        let now = Utc::now();
        let mut old = Node::register("old", "10.0.0.1:7000", 1000, 1024, now);
        old.last_heartbeat = now - chrono::Duration::minutes(2);
        let new = Node::register("new", "10.0.0.1:7000", 1000, 1024, now);
        let other = Node::register("other", "10.0.0.2:7000", 1000, 1024, now);

        let kept = dedupe_by_endpoint(&[old, new, other]);
        let ids: Vec<&str> = kept.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "other"]);
    }

    struct Harness {
        store: StateStore,
        agent: Arc<MockAgentTransport>,
        detector: DriftDetector,
        requests: crate::scheduler::ReconcileRequests,
    }

    async fn harness() -> Harness {
        let mode = Arc::new(ModeController::new(Arc::new(ClusterCache::new())));
        let store = StateStore::new(Arc::new(MemoryBackend::new()), mode, RetryPolicy::default());
        let agent = Arc::new(MockAgentTransport::new());
        let (handle, requests) = ReconcileHandle::channel();
        let detector = DriftDetector::new(
            store.clone(),
            agent.clone(),
            handle,
            Arc::new(SchedulerMetrics::new().unwrap()),
            Duration::from_secs(300),
            Duration::from_secs(180),
        );
        store
            .put_node(&Node::register("n1", "10.0.0.1:7000", 4000, 8192, Utc::now()))
            .await
            .unwrap();
        Harness {
            store,
            agent,
            detector,
            requests,
        }
    }

    fn workload(id: &str) -> Workload {
        let spec = WorkloadSpec::container(ContainerSpec {
            image: "alpine:latest".to_string(),
            ..Default::default()
        });
        Workload::new(id, spec, DesiredState::Running, 5, Utc::now())
    }

    #[tokio::test]
    async fn test_unknown_orphan_is_deleted() {
        let h = harness().await;
        h.agent.host("10.0.0.1:7000", "w3", ActualState::Running, "rev");

        let findings = h.detector.detect_once().await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].drift_type, DriftType::OrphanOnAgent);
        assert_eq!(findings[0].action, DriftAction::DeleteOnAgent);
        assert!(findings[0].resolved);
        assert!(h.agent.hosted("10.0.0.1:7000").is_empty());

        let records = h.store.list_drift().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].workload_id, "w3");
    }

    #[tokio::test]
    async fn test_unassigned_orphan_is_adopted() {
        let mut h = harness().await;
        let w = workload("w1");
        h.store.put_workload(&w).await.unwrap();
        h.agent.host("10.0.0.1:7000", "w1", ActualState::Running, &w.revision_id);

        let findings = h.detector.detect_once().await.unwrap();
        assert_eq!(findings[0].action, DriftAction::Adopt);
        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.node_id.as_deref(), Some("n1"));
        assert_eq!(h.store.get_assignment("w1").await.unwrap().unwrap().node_id, "n1");
        assert_eq!(h.requests.recv().await.unwrap().workload_id, "w1");
    }

    #[tokio::test]
    async fn test_missing_and_mismatches() {
        let mut h = harness().await;
        let now = Utc::now();

        let mut missing = workload("missing");
        missing.assign("n1", now);
        h.store.put_workload(&missing).await.unwrap();

        let mut stale = workload("stale");
        stale.assign("n1", now);
        stale.set_status(WorkloadStatus::Running, now);
        h.store.put_workload(&stale).await.unwrap();
        h.agent.host("10.0.0.1:7000", "stale", ActualState::Stopped, &stale.revision_id);

        let mut old = workload("old");
        old.assign("n1", now);
        old.set_status(WorkloadStatus::Running, now);
        h.store.put_workload(&old).await.unwrap();
        h.agent.host("10.0.0.1:7000", "old", ActualState::Running, "previous-revision");

        let findings = h.detector.detect_once().await.unwrap();
        let by_id: HashMap<&str, &DriftFinding> =
            findings.iter().map(|f| (f.workload_id.as_str(), f)).collect();
        assert_eq!(by_id["missing"].drift_type, DriftType::MissingOnAgent);
        assert_eq!(by_id["stale"].drift_type, DriftType::StateMismatch);
        assert_eq!(by_id["old"].drift_type, DriftType::RevisionMismatch);

        let stale = h.store.get_workload("stale").await.unwrap().unwrap();
        assert_eq!(stale.status, WorkloadStatus::Stopped);
        let old = h.store.get_workload("old").await.unwrap().unwrap();
        assert_eq!(old.status, WorkloadStatus::Updating);
        let missing = h.store.get_workload("missing").await.unwrap().unwrap();
        assert!(missing.retry.next_retry_at.is_some());

        let mut triggered = vec![
            h.requests.recv().await.unwrap().workload_id,
            h.requests.recv().await.unwrap().workload_id,
        ];
        triggered.sort();
        assert_eq!(triggered, vec!["missing".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn test_degraded_mode_only_logs() {
        let h = harness().await;
        h.agent.host("10.0.0.1:7000", "w3", ActualState::Running, "rev");
        h.store.mode().enter_degraded("outage");

        let findings = h.detector.detect_once().await.unwrap();
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].resolved);
        assert_eq!(h.agent.hosted("10.0.0.1:7000").len(), 1);
        assert_eq!(h.agent.delete_count("w3"), 0);
    }

    /// Who the store says owns `w1` when n1's agent reports it.
    #[derive(Debug, Clone, Copy)]
    enum Owner {
        NoRecord,
        DeleteRequested,
        Unassigned,
        SameEndpoint,
        Unreachable,
        HealthyHosting,
        HealthyEmpty,
    }

    #[rstest::rstest]
    #[case::no_record(Owner::NoRecord, DriftAction::DeleteOnAgent, true)]
    #[case::delete_requested(Owner::DeleteRequested, DriftAction::DeleteOnAgent, true)]
    #[case::unassigned(Owner::Unassigned, DriftAction::Adopt, true)]
    #[case::same_endpoint(Owner::SameEndpoint, DriftAction::Rebind, true)]
    #[case::unreachable_owner(Owner::Unreachable, DriftAction::FailoverAdopt, true)]
    #[case::owner_hosts_it(Owner::HealthyHosting, DriftAction::DeleteDuplicate, true)]
    #[case::owner_lacks_it(Owner::HealthyEmpty, DriftAction::Investigate, false)]
    #[tokio::test]
    async fn test_orphan_remediation(
        #[case] owner: Owner,
        #[case] expected: DriftAction,
        #[case] resolved: bool,
    ) {
        let h = harness().await;
        let now = Utc::now();
        let mut w = workload("w1");

        match owner {
            Owner::NoRecord => {}
            Owner::DeleteRequested => {
                w.desired_state = DesiredState::Deleted;
                h.store.put_workload(&w).await.unwrap();
            }
            Owner::Unassigned => h.store.put_workload(&w).await.unwrap(),
            Owner::SameEndpoint => {
                let mut rotated = Node::register("n0", "10.0.0.1:7000", 4000, 8192, now);
                rotated.last_heartbeat = now - chrono::Duration::minutes(2);
                h.store.put_node(&rotated).await.unwrap();
                w.assign("n0", now);
                h.store.put_workload(&w).await.unwrap();
            }
            Owner::Unreachable => {
                let mut lost = Node::register("n2", "10.0.0.2:7000", 4000, 8192, now);
                lost.mark_not_ready(crate::model::StatusSource::Monitor, "heartbeat timeout", now)
                    .unwrap();
                h.store.put_node(&lost).await.unwrap();
                w.assign("n2", now);
                h.store.put_workload(&w).await.unwrap();
            }
            Owner::HealthyHosting | Owner::HealthyEmpty => {
                h.store
                    .put_node(&Node::register("n2", "10.0.0.2:7000", 4000, 8192, now))
                    .await
                    .unwrap();
                w.assign("n2", now);
                h.store.put_workload(&w).await.unwrap();
                if matches!(owner, Owner::HealthyHosting) {
                    h.agent.host("10.0.0.2:7000", "w1", ActualState::Running, &w.revision_id);
                }
            }
        }
        h.agent.host("10.0.0.1:7000", "w1", ActualState::Running, &w.revision_id);

        let findings = h.detector.detect_once().await.unwrap();
        let finding = findings
            .iter()
            .find(|f| f.node_id == "n1" && f.workload_id == "w1")
            .unwrap();
        assert_eq!(finding.drift_type, DriftType::OrphanOnAgent);
        assert_eq!(finding.action, expected);
        assert_eq!(finding.resolved, resolved);

        let record = h
            .store
            .list_drift()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.node_id == "n1" && r.workload_id == "w1")
            .unwrap();
        assert_eq!(record.action, expected.as_str());
        assert_eq!(record.resolved, resolved);

        let on_n1 = h.agent.hosted("10.0.0.1:7000").contains_key("w1");
        let stored = h.store.get_workload("w1").await.unwrap();
        let owner_id = stored.as_ref().and_then(|w| w.node_id.clone());
        match expected {
            DriftAction::DeleteOnAgent => {
                assert!(!on_n1);
                assert_eq!(h.agent.delete_count("w1"), 1);
                assert_eq!(stored.is_some(), matches!(owner, Owner::DeleteRequested));
            }
            DriftAction::Adopt | DriftAction::Rebind | DriftAction::FailoverAdopt => {
                assert!(on_n1);
                assert_eq!(owner_id.as_deref(), Some("n1"));
                assert_eq!(h.store.get_assignment("w1").await.unwrap().unwrap().node_id, "n1");
            }
            DriftAction::DeleteDuplicate => {
                assert!(!on_n1);
                assert!(h.agent.hosted("10.0.0.2:7000").contains_key("w1"));
                assert_eq!(owner_id.as_deref(), Some("n2"));
            }
            DriftAction::Investigate => {
                assert!(on_n1);
                assert_eq!(h.agent.delete_count("w1"), 0);
                assert_eq!(owner_id.as_deref(), Some("n2"));
            }
            other => panic!("unexpected orphan action {other:?}"),
        }
        if matches!(owner, Owner::SameEndpoint) {
            let w = stored.unwrap();
            assert_eq!(w.metadata.previous_node.as_deref(), Some("n0"));
        }
    }

    #[tokio::test]
    async fn test_remediation_skips_workload_written_after_snapshot() {
        let h = harness().await;
        let w = workload("w1");
        h.store.put_workload(&w).await.unwrap();
        h.agent.host("10.0.0.1:7000", "w1", ActualState::Running, &w.revision_id);

        let view = h.detector.snapshot().await.unwrap();
        let node = view.nodes["n1"].clone();
        let reported = h.agent.list_workloads(&node).await.unwrap();
        let mut findings = h.detector.compare(&view, &node, reported);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].action, DriftAction::Adopt);

        // the reconciler places it elsewhere in the meantime
        let mut placed = h.store.get_workload("w1").await.unwrap().unwrap();
        placed.assign("n2", Utc::now() + chrono::Duration::seconds(1));
        h.store.put_workload(&placed).await.unwrap();

        h.detector.remediate(&view, &mut findings[0]).await.unwrap();
        assert!(!findings[0].resolved);
        assert!(findings[0].last_error.is_some());
        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.node_id.as_deref(), Some("n2"));
        assert!(h.store.get_assignment("w1").await.unwrap().is_none());
    }
}
