//! Per-workload reconciliation.
//!
//! One pass over a workload walks a fixed sequence:
//!
//! 1. parked or backing off: nothing to do
//! 2. deleted and unassigned: purge
//! 3. unassigned: place
//! 4. retry due: clear the timer
//! 5. node unavailable: fail over, or wait with backoff
//! 6. observe the agent (unreachable marks the node and goes back to 5)
//! 7. decide whether the observation satisfies the intent
//! 8. apply, stop or delete on the agent
//! 9. classify the result and account retries
//! 10. persist the reconciliation record
//!
//! Passes that decide nothing needs doing write nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use persys_events::{EventType, SchedulerEvent, SchedulerEventBuilder};
use persys_reconcile::{Backoff, ConvergenceStatus};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn, Span};

use super::placement::PlacementEngine;
use crate::agent::{AgentError, AgentTransport, ApplyResult};
use crate::config::{AgentConfig, PolicyConfig};
use crate::metrics::SchedulerMetrics;
use crate::model::{
    ActualState, AssignmentRecord, DesiredState, Node, ReconciliationRecord, RetryRecord,
    StatusSource, Workload, WorkloadStatus, WorkloadType,
};
use crate::node_health::mark_node_not_ready;
use crate::store::{StateStore, StoreError};

/// Times one pass may go back to the node-health step after finding an
/// agent unreachable.
const MAX_UNREACHABLE_ROUNDS: u32 = 2;

/// Action history collected when an apply does not converge.
const ACTION_HISTORY_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReconcileAction {
    NoAction,
    BackoffWait,
    FinalizeDelete,
    Assign,
    Rescheduled,
    AwaitFailover,
    ReapplyRunning,
    ApplyStopped,
    DeleteWorkload,
    ReschedulePending,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAction => "NoAction",
            Self::BackoffWait => "BackoffWait",
            Self::FinalizeDelete => "FinalizeDelete",
            Self::Assign => "Assign",
            Self::Rescheduled => "Rescheduled",
            Self::AwaitFailover => "AwaitFailover",
            Self::ReapplyRunning => "ReapplyRunning",
            Self::ApplyStopped => "ApplyStopped",
            Self::DeleteWorkload => "DeleteWorkload",
            Self::ReschedulePending => "ReschedulePending",
        }
    }

    /// Actions that leave the workload untouched.
    pub fn is_passive(&self) -> bool {
        matches!(self, Self::NoAction | Self::BackoffWait)
    }
}

impl std::fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pass failed, for callers that surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidSpec,
    Runtime,
    Placement,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub workload_id: String,
    pub action: ReconcileAction,
    pub success: bool,
    pub reason: String,
    pub failure: Option<FailureKind>,
}

impl ReconcileOutcome {
    fn ok(workload_id: &str, action: ReconcileAction, reason: impl Into<String>) -> Self {
        Self {
            workload_id: workload_id.to_string(),
            action,
            success: true,
            reason: reason.into(),
            failure: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workload {0} not found")]
    NotFound(String),
}

/// Per-cycle counters.
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub errors: u32,
    pub actions: BTreeMap<ReconcileAction, u32>,
}

impl CycleStats {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        self.processed += 1;
        if outcome.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if !outcome.action.is_passive() {
            *self.actions.entry(outcome.action).or_default() += 1;
        }
    }

    fn result_label(&self) -> &'static str {
        match (self.failed + self.errors, self.processed) {
            (0, _) => "success",
            (_, 0) => "error",
            _ => "partial",
        }
    }
}

/// Whether the periodic loop should look at `workload` at all.
pub fn needs_reconcile(workload: &Workload) -> bool {
    match workload.status {
        WorkloadStatus::Completed => false,
        WorkloadStatus::Deleted => workload.desired_state == DesiredState::Deleted,
        _ => true,
    }
}

/// What the agent reported for the workload.
#[derive(Debug, Clone)]
struct Observation {
    state: ActualState,
    revision: Option<String>,
}

enum Observed {
    Seen(Node, Observation),
    Done(ReconcileOutcome),
}

/// Progress of an apply toward the intent.
fn convergence(observed: ActualState, desired: DesiredState) -> ConvergenceStatus {
    if observed.satisfies(desired) {
        ConvergenceStatus::Converged
    } else {
        match observed {
            ActualState::Failed => ConvergenceStatus::Diverged,
            ActualState::Unknown => ConvergenceStatus::Unknown,
            _ => ConvergenceStatus::Converging,
        }
    }
}

/// Remediation for an observation, or `None` when nothing is needed.
fn select_action(desired: DesiredState, actual: ActualState, revision_drift: bool) -> Option<ReconcileAction> {
    match desired {
        DesiredState::Deleted => Some(ReconcileAction::DeleteWorkload),
        DesiredState::Running => {
            let needs = revision_drift
                || matches!(
                    actual,
                    ActualState::Missing | ActualState::Stopped | ActualState::Failed | ActualState::Unknown
                );
            needs.then_some(ReconcileAction::ReapplyRunning)
        }
        DesiredState::Stopped => {
            let needs = revision_drift
                || matches!(actual, ActualState::Running | ActualState::Pending | ActualState::Unknown);
            needs.then_some(ReconcileAction::ApplyStopped)
        }
    }
}

pub struct Reconciler {
    store: StateStore,
    agent: Arc<dyn AgentTransport>,
    placement: PlacementEngine,
    metrics: Arc<SchedulerMetrics>,
    policy: PolicyConfig,
    agent_config: AgentConfig,
    backoff: Backoff,
}

impl Reconciler {
    pub fn new(
        store: StateStore,
        agent: Arc<dyn AgentTransport>,
        metrics: Arc<SchedulerMetrics>,
        policy: PolicyConfig,
        agent_config: AgentConfig,
    ) -> Self {
        Self {
            placement: PlacementEngine::new(policy.placement_heartbeat_max_age),
            backoff: Backoff::new(policy.retry_base, policy.retry_max),
            store,
            agent,
            metrics,
            policy,
            agent_config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Reconcile every workload once, in store order.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleStats, ReconcileError> {
        let started = Instant::now();
        if let Some((mode, reason)) = self.store.mode().write_block() {
            debug!(mode = %mode, reason = %reason, "Skipping reconcile cycle; writes are frozen");
            self.metrics.record_cycle("skipped", started.elapsed());
            return Ok(CycleStats::default());
        }

        let workloads = match self.store.list_workloads().await {
            Ok(workloads) => workloads,
            Err(e) => {
                self.metrics.record_cycle("error", started.elapsed());
                return Err(e.into());
            }
        };

        let mut stats = CycleStats::default();
        for workload in workloads.into_iter().filter(needs_reconcile) {
            let workload_id = workload.id.clone();
            match self.reconcile_workload(workload).await {
                Ok(outcome) => stats.record(&outcome),
                Err(e) => {
                    stats.errors += 1;
                    warn!(workload_id = %workload_id, error = %e, "Failed to reconcile workload");
                    if !self.store.mode().writes_allowed() {
                        break;
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        self.metrics.record_cycle(stats.result_label(), elapsed);
        if !stats.actions.is_empty() || stats.failed > 0 || stats.errors > 0 {
            let actions: Vec<String> = stats
                .actions
                .iter()
                .map(|(action, count)| format!("{action}={count}"))
                .collect();
            info!(
                processed = stats.processed,
                succeeded = stats.succeeded,
                failed = stats.failed,
                errors = stats.errors,
                actions = %actions.join(","),
                duration_ms = elapsed.as_millis() as u64,
                "Reconcile cycle complete"
            );
        }
        Ok(stats)
    }

    /// Load and reconcile one workload. `None` when there is nothing to
    /// reconcile (gone, terminal, or writes frozen).
    pub async fn reconcile_by_id(&self, workload_id: &str) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        if !self.store.mode().writes_allowed() {
            return Ok(None);
        }
        match self.store.get_workload(workload_id).await? {
            Some(workload) if needs_reconcile(&workload) => {
                self.reconcile_workload(workload).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    #[instrument(
        skip(self, workload),
        fields(
            workload_id = %workload.id,
            workload_type = %workload.workload_type(),
            desired_state = %workload.desired_state,
            node_id = tracing::field::Empty,
        )
    )]
    pub async fn reconcile_workload(&self, mut workload: Workload) -> Result<ReconcileOutcome, ReconcileError> {
        let now = Utc::now();
        if let Some(node_id) = &workload.node_id {
            Span::current().record("node_id", node_id.as_str());
        }

        if workload.status == WorkloadStatus::Failed && workload.retry.is_exhausted() {
            return Ok(self.passive(&workload, ReconcileAction::NoAction, "retry budget exhausted"));
        }
        if let Some(at) = workload.retry.next_retry_at.filter(|at| *at > now) {
            return Ok(self.passive(
                &workload,
                ReconcileAction::BackoffWait,
                format!("next retry at {}", at.to_rfc3339()),
            ));
        }

        if workload.desired_state == DesiredState::Deleted && workload.node_id.is_none() {
            return self.finalize_delete(&workload, "unassigned workload deleted").await;
        }

        if workload.node_id.is_none() {
            if let Some(outcome) = self.assign(&mut workload, now).await? {
                return Ok(outcome);
            }
        }

        let mut dirty = false;
        if workload.retry.next_retry_at.take().is_some() {
            workload.set_status(WorkloadStatus::Pending, now);
            dirty = true;
        }
        workload.ensure_revision();

        let (node, observation) = match self.observe(&mut workload, now).await? {
            Observed::Seen(node, observation) => (node, observation),
            Observed::Done(outcome) => return Ok(outcome),
        };
        let actual = observation.state;
        let desired = workload.desired_state;

        if desired == DesiredState::Deleted {
            if actual == ActualState::Missing {
                return self.finalize_delete(&workload, "agent has no record").await;
            }
            return self.delete_on_agent(&mut workload, &node).await;
        }

        let launched_here = workload.metadata.last_applied_node.as_deref() == Some(node.node_id.as_str());
        if matches!(actual, ActualState::Missing | ActualState::Pending)
            && launched_here
            && workload.launched_within(self.policy.missing_grace, now)
        {
            return self
                .settle(&mut workload, dirty, "waiting for agent to report launched workload")
                .await;
        }

        let revision_drift = observation
            .revision
            .as_deref()
            .is_some_and(|r| r != workload.revision_id);
        let Some(action) = select_action(desired, actual, revision_drift) else {
            let status = actual.to_status();
            if actual.satisfies(desired) && workload.status != status {
                workload.status_info.actual_state = Some(actual);
                workload.set_status(status, now);
                dirty = true;
            }
            return self
                .settle(&mut workload, dirty, format!("actual {actual} satisfies desired {desired}"))
                .await;
        };

        if self.reapply_guarded(&workload, &node, action, now) {
            return self.settle(&mut workload, dirty, "reapply guard").await;
        }
        if revision_drift {
            debug!(
                stored = %workload.revision_id,
                reported = ?observation.revision,
                "Agent runs a different revision"
            );
        }
        self.apply(&mut workload, &node, action).await
    }

    /// Outcome for passes that change nothing.
    fn passive(&self, workload: &Workload, action: ReconcileAction, reason: impl Into<String>) -> ReconcileOutcome {
        self.metrics.record_reconcile(action.as_str(), true);
        ReconcileOutcome::ok(&workload.id, action, reason)
    }

    /// NoAction, persisting only bookkeeping changes made earlier in the pass.
    async fn settle(
        &self,
        workload: &mut Workload,
        dirty: bool,
        reason: impl Into<String>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if dirty {
            self.store.put_workload(workload).await?;
        }
        Ok(self.passive(workload, ReconcileAction::NoAction, reason))
    }

    async fn finalize_delete(&self, workload: &Workload, reason: &str) -> Result<ReconcileOutcome, ReconcileError> {
        self.store.purge_workload(&workload.id).await?;
        info!(workload_id = %workload.id, reason, "Workload finalized");
        let mut event = SchedulerEvent::builder(EventType::WorkloadDeleted)
            .workload(workload.id.clone())
            .reason(reason);
        if let Some(node_id) = &workload.metadata.previous_node {
            event = event.node(node_id.clone());
        }
        self.store.record_event(event).await;
        self.metrics
            .record_reconcile(ReconcileAction::FinalizeDelete.as_str(), true);
        Ok(ReconcileOutcome::ok(&workload.id, ReconcileAction::FinalizeDelete, reason))
    }

    /// Place an unassigned workload. `Some` when placement failed.
    async fn assign(&self, workload: &mut Workload, now: DateTime<Utc>) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        let nodes = self.store.list_nodes().await?;
        let node_id = match self.placement.place(workload, &nodes, now) {
            Ok(node) => node.node_id.clone(),
            Err(e) => {
                let reason = e.to_string();
                debug!(reason = %reason, "Placement failed");
                let outcome = self
                    .finish(workload, ReconcileAction::Assign, false, reason, Some(FailureKind::Placement))
                    .await?;
                return Ok(Some(outcome));
            }
        };

        workload.assign(&node_id, now);
        workload.set_status(WorkloadStatus::Scheduled, now);
        workload.append_log(format!("scheduled on {node_id}"));
        self.store.put_workload(workload).await?;
        self.store
            .put_assignment(&AssignmentRecord {
                workload_id: workload.id.clone(),
                node_id: node_id.clone(),
                reason: "placement".to_string(),
                created_at: now,
            })
            .await?;
        Span::current().record("node_id", node_id.as_str());
        info!(node_id = %node_id, "Workload scheduled");
        self.store
            .record_event(
                SchedulerEvent::builder(EventType::WorkloadScheduled)
                    .workload(workload.id.clone())
                    .node(node_id.clone())
                    .reason(format!("placed on {node_id}"))
                    .detail("workload_type", workload.workload_type().as_str())
                    .timestamp(now),
            )
            .await;
        Ok(None)
    }

    /// Steps 5 and 6: make sure the assigned node is usable, then ask its
    /// agent what it runs.
    async fn observe(&self, workload: &mut Workload, now: DateTime<Utc>) -> Result<Observed, ReconcileError> {
        let mut unreachable_rounds = 0;
        loop {
            let Some(node_id) = workload.node_id.clone() else {
                return Ok(Observed::Done(ReconcileOutcome::ok(
                    &workload.id,
                    ReconcileAction::NoAction,
                    "workload lost its assignment",
                )));
            };
            let node = self.store.get_node(&node_id).await?;

            let unavailable = match &node {
                None => Some(format!("node {node_id} is not registered")),
                Some(n) if !n.is_ready() => Some(format!("node {node_id} unavailable: {}", n.status_reason)),
                Some(n) if n.heartbeat_older_than(self.policy.node_unavailable_grace, now) => Some(format!(
                    "node {node_id} unavailable: no heartbeat for {}s",
                    n.heartbeat_age(now).num_seconds()
                )),
                Some(_) => None,
            };

            if let Some(reason) = unavailable {
                if workload.desired_state != DesiredState::Deleted {
                    if let Some(outcome) = self.failover(workload, &node_id, &reason, now).await? {
                        return Ok(Observed::Done(outcome));
                    }
                    continue;
                }
                if node.is_none() {
                    // nothing left to delete the workload from
                    workload.clear_assignment(now);
                    let outcome = self.finalize_delete(workload, &reason).await?;
                    return Ok(Observed::Done(outcome));
                }
            }
            let Some(mut node) = node else {
                continue;
            };

            match self.agent.get_workload_status(&node, &workload.id).await {
                Ok(status) => {
                    return Ok(Observed::Seen(
                        node,
                        Observation {
                            state: status.actual_state,
                            revision: status.revision_id,
                        },
                    ))
                }
                Err(e) if e.is_not_found() => {
                    return Ok(Observed::Seen(
                        node,
                        Observation {
                            state: ActualState::Missing,
                            revision: None,
                        },
                    ))
                }
                Err(e)
                    if e.is_unreachable()
                        && workload.desired_state != DesiredState::Deleted
                        && unreachable_rounds < MAX_UNREACHABLE_ROUNDS =>
                {
                    unreachable_rounds += 1;
                    mark_node_not_ready(
                        &self.store,
                        &mut node,
                        StatusSource::Reconciler,
                        &format!("agent unreachable: {e}"),
                    )
                    .await?;
                }
                Err(e) if e.is_unreachable() => {
                    let action = if workload.desired_state == DesiredState::Deleted {
                        ReconcileAction::DeleteWorkload
                    } else {
                        ReconcileAction::AwaitFailover
                    };
                    let outcome = self.fail(workload, action, &e, FailureKind::Unreachable).await?;
                    return Ok(Observed::Done(outcome));
                }
                Err(e) => {
                    warn!(node_id = %node.node_id, error = %e, "Agent status query failed");
                    return Ok(Observed::Seen(
                        node,
                        Observation {
                            state: ActualState::Unknown,
                            revision: None,
                        },
                    ));
                }
            }
        }
    }

    /// Move a workload off an unavailable node. `None` after a successful
    /// move; the pass continues against the new node.
    async fn failover(
        &self,
        workload: &mut Workload,
        from: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        let grace = self.policy.node_unavailable_grace;
        let nodes: Vec<Node> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| !n.heartbeat_older_than(grace, now))
            .collect();

        let to = match self.placement.place_excluding(workload, &nodes, Some(from), now) {
            Ok(node) => node.node_id.clone(),
            Err(e) => {
                let delay = self.backoff.delay(workload.retry.attempts.max(1));
                workload.retry.next_retry_at = Some(now + chrono_duration(delay));
                let reason = format!("{reason}; {e}");
                debug!(reason = %reason, "No failover target");
                if workload.status == WorkloadStatus::Running {
                    workload.set_status(WorkloadStatus::Unknown, now);
                }
                let outcome = self
                    .finish(workload, ReconcileAction::AwaitFailover, true, reason, None)
                    .await?;
                return Ok(Some(outcome));
            }
        };

        workload.assign(&to, now);
        workload.retry.reset();
        workload.status_info.actual_state = None;
        workload.set_status(WorkloadStatus::Scheduled, now);
        workload.append_log(format!("rescheduled from {from} to {to}: {reason}"));
        self.store.put_workload(workload).await?;
        self.store
            .put_assignment(&AssignmentRecord {
                workload_id: workload.id.clone(),
                node_id: to.clone(),
                reason: format!("failover from {from}"),
                created_at: now,
            })
            .await?;
        self.store
            .put_reconciliation(&ReconciliationRecord {
                workload_id: workload.id.clone(),
                action: ReconcileAction::Rescheduled.as_str().to_string(),
                success: true,
                reason: reason.to_string(),
                attempted_at: now,
            })
            .await?;
        self.metrics
            .record_reconcile(ReconcileAction::Rescheduled.as_str(), true);
        Span::current().record("node_id", to.as_str());
        warn!(from, to = %to, reason, "Workload rescheduled");
        self.store
            .record_event(
                SchedulerEvent::builder(EventType::Rescheduled)
                    .workload(workload.id.clone())
                    .node(to)
                    .reason(format!("node {from} unavailable"))
                    .detail("previous_node", from)
                    .detail("cause", reason)
                    .timestamp(now),
            )
            .await;
        Ok(None)
    }

    fn reapply_guarded(&self, workload: &Workload, node: &Node, action: ReconcileAction, now: DateTime<Utc>) -> bool {
        let meta = &workload.metadata;
        meta.last_applied_revision.as_deref() == Some(workload.revision_id.as_str())
            && meta.last_applied_node.as_deref() == Some(node.node_id.as_str())
            && meta.last_action.as_deref() == Some(action.as_str())
            && workload.launched_within(self.policy.reapply_guard, now)
    }

    async fn apply(
        &self,
        workload: &mut Workload,
        node: &Node,
        action: ReconcileAction,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let desired = if action == ReconcileAction::ApplyStopped {
            DesiredState::Stopped
        } else {
            DesiredState::Running
        };
        workload.metadata.last_action = Some(action.as_str().to_string());

        // the apply RPC and the convergence polling share one deadline
        let timeout = self.agent_config.apply_timeout_for(workload.workload_type());
        let deadline = Instant::now() + timeout;
        let applied = tokio::time::timeout_at(deadline, self.agent.apply_workload(node, workload, desired))
            .await
            .unwrap_or_else(|_| {
                Err(AgentError::Timeout {
                    endpoint: node.grpc_endpoint.clone(),
                    after: timeout,
                })
            });
        let result = match applied {
            Ok(applied) => {
                self.await_convergence(workload, node, desired, applied, deadline, timeout)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(state) => {
                let now = Utc::now();
                workload.metadata.last_launch_time = Some(now);
                workload.metadata.last_applied_revision = Some(workload.revision_id.clone());
                workload.metadata.last_applied_node = Some(node.node_id.clone());
                workload.metadata.last_error = None;
                workload.status_info.actual_state = Some(state);
                workload.status_info.failure_reason = None;
                workload.retry.reset();
                workload.set_status(state.to_status(), now);
                let reason = format!("{} on {}", state, node.node_id);
                self.finish(workload, action, true, reason, None).await
            }
            Err(AgentError::RuntimeUnavailable {
                workload_type,
                message,
            }) => self.reschedule_incapable(workload, node, workload_type, message).await,
            Err(AgentError::SpecRejected(message)) => self.reject_spec(workload, action, message).await,
            Err(e) => {
                let kind = if e.is_unreachable() {
                    FailureKind::Unreachable
                } else {
                    FailureKind::Runtime
                };
                self.fail(workload, action, &e, kind).await
            }
        }
    }

    /// Poll until the agent reports a terminal state or `deadline` passes.
    async fn await_convergence(
        &self,
        workload: &mut Workload,
        node: &Node,
        desired: DesiredState,
        applied: ApplyResult,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ActualState, AgentError> {
        if !applied.message.is_empty() {
            workload.append_log(format!("apply: {}", applied.message));
        }

        let mut observed = applied.status.map(|s| (s.actual_state, s.message));
        loop {
            if let Some((state, message)) = observed.take() {
                let status = convergence(state, desired);
                if status.is_converged() {
                    return Ok(state);
                }
                if !status.is_converging() {
                    return Err(AgentError::Runtime {
                        category: "converge".to_string(),
                        message: message.unwrap_or_else(|| format!("workload reported {state}")),
                    });
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.agent_config.converge_poll_interval.min(deadline - now)).await;

            observed = match self.agent.get_workload_status(node, &workload.id).await {
                Ok(status) => Some((status.actual_state, status.message)),
                Err(e) if e.is_not_found() => Some((ActualState::Missing, None)),
                Err(e) => {
                    debug!(error = %e, "Status poll failed during convergence");
                    None
                }
            };
        }

        self.collect_actions(workload, node).await;
        Err(AgentError::Runtime {
            category: "timeout".to_string(),
            message: format!(
                "workload did not reach {desired} within {}s",
                timeout.as_secs()
            ),
        })
    }

    /// Copy the agent's recent action history into the workload log.
    async fn collect_actions(&self, workload: &mut Workload, node: &Node) {
        match self
            .agent
            .list_actions(node, &workload.id, true, ACTION_HISTORY_LIMIT)
            .await
        {
            Ok(actions) => {
                for action in actions.iter().rev() {
                    workload.append_log(action.log_line());
                }
            }
            Err(e) => debug!(error = %e, "Could not collect agent actions"),
        }
    }

    /// The node lacks the runtime: drop the capability and re-place the
    /// workload without spending a retry.
    async fn reschedule_incapable(
        &self,
        workload: &mut Workload,
        node: &Node,
        workload_type: WorkloadType,
        message: String,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let now = Utc::now();
        let mut node = node.clone();
        if node.downgrade_capability(workload_type) {
            self.store.put_node(&node).await?;
            warn!(node_id = %node.node_id, workload_type = %workload_type, "Node capability downgraded");
            self.store
                .record_event(
                    SchedulerEvent::builder(EventType::CapabilityDowngraded)
                        .node(node.node_id.clone())
                        .workload(workload.id.clone())
                        .reason(message.clone())
                        .detail("workload_type", workload_type.as_str())
                        .timestamp(now),
                )
                .await;
        }

        workload.clear_assignment(now);
        workload.status_info.actual_state = None;
        workload.set_status(WorkloadStatus::Pending, now);
        workload.append_log(format!("{} cannot run {workload_type}: {message}", node.node_id));
        self.store.delete_assignment(&workload.id).await?;
        let reason = format!("{workload_type} runtime not available on {}", node.node_id);
        self.finish(workload, ReconcileAction::ReschedulePending, true, reason, None)
            .await
    }

    /// The agent will never accept this spec: fail without retrying.
    async fn reject_spec(
        &self,
        workload: &mut Workload,
        action: ReconcileAction,
        message: String,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let now = Utc::now();
        let reason = format!("invalid_spec: {message}");
        workload.retry.attempts = workload.retry.max_attempts;
        workload.retry.next_retry_at = None;
        workload.status_info.failure_reason = Some(reason.clone());
        workload.set_status(WorkloadStatus::Failed, now);
        let event = SchedulerEvent::builder(EventType::WorkloadFailed)
            .workload(workload.id.clone())
            .reason(reason.clone())
            .timestamp(now);
        let outcome = self
            .finish(workload, action, false, reason, Some(FailureKind::InvalidSpec))
            .await?;
        self.store.record_event(with_node(event, workload)).await;
        Ok(outcome)
    }

    /// Retry accounting for a failed action.
    async fn fail(
        &self,
        workload: &mut Workload,
        action: ReconcileAction,
        error: &AgentError,
        kind: FailureKind,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let reason = format!("{}: {error}", error.category());
        let event = self.account_failure(workload, &reason, Utc::now());
        let outcome = self.finish(workload, action, false, reason, Some(kind)).await?;
        self.store.record_event(with_node(event, workload)).await;
        Ok(outcome)
    }

    /// Count a failure. Exhaustion fails the workload; otherwise the next
    /// attempt is scheduled with capped exponential backoff.
    fn account_failure(&self, workload: &mut Workload, reason: &str, now: DateTime<Utc>) -> SchedulerEventBuilder {
        let retry = &mut workload.retry;
        retry.attempts = (retry.attempts + 1).min(retry.max_attempts);
        let attempts = retry.attempts;

        if retry.is_exhausted() {
            retry.next_retry_at = None;
            workload.status_info.failure_reason = Some(reason.to_string());
            workload.set_status(WorkloadStatus::Failed, now);
            warn!(attempts, reason, "Workload failed after exhausting retries");
            SchedulerEvent::builder(EventType::WorkloadFailed)
                .workload(workload.id.clone())
                .reason(reason)
                .detail("attempts", attempts.to_string())
                .timestamp(now)
        } else {
            let delay = self.backoff.delay(attempts);
            let at = now + chrono_duration(delay);
            retry.next_retry_at = Some(at);
            workload.set_status(WorkloadStatus::RetryPending, now);
            debug!(attempts, delay_ms = delay.as_millis() as u64, reason, "Retry scheduled");
            SchedulerEvent::builder(EventType::RetryTriggered)
                .workload(workload.id.clone())
                .reason(reason)
                .detail("attempts", attempts.to_string())
                .detail("next_retry_at", at.to_rfc3339())
                .timestamp(now)
        }
    }

    async fn delete_on_agent(&self, workload: &mut Workload, node: &Node) -> Result<ReconcileOutcome, ReconcileError> {
        let action = ReconcileAction::DeleteWorkload;
        workload.metadata.last_action = Some(action.as_str().to_string());
        workload.set_status(WorkloadStatus::Deleting, Utc::now());

        if let Err(e) = self.agent.delete_workload(node, &workload.id).await {
            let kind = if e.is_unreachable() {
                FailureKind::Unreachable
            } else {
                FailureKind::Runtime
            };
            return self.fail(workload, action, &e, kind).await;
        }

        match self.agent.get_workload_status(node, &workload.id).await {
            Err(e) if e.is_not_found() => {
                workload.clear_assignment(Utc::now());
                self.finalize_delete(workload, "deleted on agent").await?;
                self.metrics.record_reconcile(action.as_str(), true);
                Ok(ReconcileOutcome::ok(&workload.id, action, "deleted on agent and finalized"))
            }
            _ => {
                self.finish(workload, action, true, "delete requested; awaiting agent".to_string(), None)
                    .await
            }
        }
    }

    /// Persist the workload, its retry projection and the reconciliation
    /// record for a pass that acted.
    async fn finish(
        &self,
        workload: &mut Workload,
        action: ReconcileAction,
        success: bool,
        reason: String,
        failure: Option<FailureKind>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let now = Utc::now();
        workload.metadata.last_reconciliation = Some(now);
        workload.metadata.last_reconciliation_action = Some(action.as_str().to_string());
        workload.metadata.last_reconciliation_success = Some(success);
        if !success {
            workload.metadata.last_error = Some(reason.clone());
            workload.append_log(format!("{action} failed: {reason}"));
        }
        workload.touch(now);

        self.store.put_workload(workload).await?;
        self.store.put_retry(&RetryRecord::from_workload(workload)).await?;
        self.store
            .put_reconciliation(&ReconciliationRecord {
                workload_id: workload.id.clone(),
                action: action.as_str().to_string(),
                success,
                reason: reason.clone(),
                attempted_at: now,
            })
            .await?;
        self.metrics.record_reconcile(action.as_str(), success);

        Ok(ReconcileOutcome {
            workload_id: workload.id.clone(),
            action,
            success,
            reason,
            failure,
        })
    }
}

fn with_node(event: SchedulerEventBuilder, workload: &Workload) -> SchedulerEventBuilder {
    match &workload.node_id {
        Some(node_id) => event.node(node_id.clone()),
        None => event,
    }
}

fn chrono_duration(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentTransport;
    use crate::mode::ModeController;
    use crate::model::{ContainerSpec, NodeStatus, ResourceRequirements, WorkloadSpec};
    use crate::store::{ClusterCache, KvBackend, MemoryBackend, RetryPolicy};

    struct Harness {
        store: StateStore,
        agent: Arc<MockAgentTransport>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let mode = Arc::new(ModeController::new(Arc::new(ClusterCache::new())));
        let store = StateStore::new(
            Arc::new(MemoryBackend::new()),
            mode,
            RetryPolicy {
                attempts: 2,
                backoff: Duration::from_millis(1),
            },
        );
        let agent = Arc::new(MockAgentTransport::new());
        let metrics = Arc::new(SchedulerMetrics::new().unwrap());
        let policy = PolicyConfig {
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(4),
            ..PolicyConfig::default()
        };
        let agent_config = AgentConfig {
            apply_timeout: Duration::from_millis(50),
            converge_poll_interval: Duration::from_millis(5),
            ..AgentConfig::default()
        };
        let reconciler = Reconciler::new(store.clone(), agent.clone(), metrics, policy, agent_config);
        Harness {
            store,
            agent,
            reconciler,
        }
    }

    fn workload(id: &str) -> Workload {
        let spec = WorkloadSpec::container(ContainerSpec {
            image: "alpine:latest".to_string(),
            ..Default::default()
        })
        .with_resources(ResourceRequirements {
            cpu_millicores: 250,
            memory_mb: 256,
            disk_gb: 0,
        });
        Workload::new(id, spec, DesiredState::Running, 5, Utc::now())
    }

    async fn add_node(store: &StateStore, id: &str, endpoint: &str) {
        let node = Node::register(id, endpoint, 4000, 8192, Utc::now()).with_types([WorkloadType::Container]);
        store.put_node(&node).await.unwrap();
    }

    #[test]
    fn test_action_table() {
        use ActualState as A;
        use DesiredState as D;
        assert_eq!(select_action(D::Running, A::Missing, false), Some(ReconcileAction::ReapplyRunning));
        assert_eq!(select_action(D::Running, A::Running, false), None);
        assert_eq!(select_action(D::Running, A::Pending, false), None);
        assert_eq!(select_action(D::Running, A::Running, true), Some(ReconcileAction::ReapplyRunning));
        assert_eq!(select_action(D::Stopped, A::Running, false), Some(ReconcileAction::ApplyStopped));
        assert_eq!(select_action(D::Stopped, A::Stopped, false), None);
        assert_eq!(select_action(D::Stopped, A::Failed, false), None);
        assert_eq!(select_action(D::Deleted, A::Running, false), Some(ReconcileAction::DeleteWorkload));
    }

    #[tokio::test]
    async fn test_assign_and_apply() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();

        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert_eq!(outcome.action, ReconcileAction::ReapplyRunning);
        assert!(outcome.success);

        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.node_id.as_deref(), Some("n1"));
        assert_eq!(w.status, WorkloadStatus::Running);
        assert!(w.metadata.last_launch_time.is_some());
        let assignment = h.store.get_assignment("w1").await.unwrap().unwrap();
        assert_eq!(assignment.node_id, "n1");
    }

    #[tokio::test]
    async fn test_converged_workload_is_side_effect_free() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.reconciler.reconcile_by_id("w1").await.unwrap();

        let before = h.store.backend().list("/").await.unwrap();
        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert_eq!(outcome.action, ReconcileAction::NoAction);
        assert!(outcome.success);
        assert_eq!(h.store.backend().list("/").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_placement_failure_is_recorded() {
        let h = harness();
        h.store.put_workload(&workload("w1")).await.unwrap();

        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert_eq!(outcome.action, ReconcileAction::Assign);
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Placement));
        let record = h.store.get_reconciliation("w1").await.unwrap().unwrap();
        assert_eq!(record.action, "Assign");
        assert!(record.reason.contains("no nodes registered"));
    }

    #[tokio::test]
    async fn test_runtime_unavailable_reschedules_without_retry() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.agent.fail_next_apply(
            "w1",
            AgentError::RuntimeUnavailable {
                workload_type: WorkloadType::Container,
                message: "docker runtime not available".to_string(),
            },
        );

        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert_eq!(outcome.action, ReconcileAction::ReschedulePending);
        assert!(outcome.success);

        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.node_id, None);
        assert_eq!(w.retry.attempts, 0);
        assert!(h.store.get_assignment("w1").await.unwrap().is_none());
        let node = h.store.get_node("n1").await.unwrap().unwrap();
        assert!(!node.supports(WorkloadType::Container));
    }

    #[tokio::test]
    async fn test_spec_rejection_fails_immediately() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.agent
            .fail_next_apply("w1", AgentError::SpecRejected("unknown restart policy".to_string()));

        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert_eq!(outcome.failure, Some(FailureKind::InvalidSpec));
        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.status, WorkloadStatus::Failed);
        assert!(w.retry.is_exhausted());

        // parked
        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert_eq!(outcome.action, ReconcileAction::NoAction);
        assert_eq!(h.agent.apply_count("w1"), 1);
    }

    #[tokio::test]
    async fn test_runtime_failure_schedules_backoff() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        let mut w = workload("w1");
        w.retry.max_attempts = 3;
        h.store.put_workload(&w).await.unwrap();
        h.agent.fail_next_apply(
            "w1",
            AgentError::Runtime {
                category: "pull".to_string(),
                message: "manifest unknown".to_string(),
            },
        );

        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert!(!outcome.success);
        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.status, WorkloadStatus::RetryPending);
        assert_eq!(w.retry.attempts, 1);
        assert!(w.retry.next_retry_at.is_some());
        let retry = h.store.get_retry("w1").await.unwrap().unwrap();
        assert_eq!(retry.attempts, 1);
    }

    #[tokio::test]
    async fn test_unreachable_agent_marks_node_and_fails_over() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.reconciler.reconcile_by_id("w1").await.unwrap();

        add_node(&h.store, "n2", "10.0.0.2:7000").await;
        h.agent.set_unreachable("10.0.0.1:7000", true);

        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert_eq!(outcome.action, ReconcileAction::ReapplyRunning);
        let n1 = h.store.get_node("n1").await.unwrap().unwrap();
        assert_eq!(n1.status, NodeStatus::NotReady);
        assert_eq!(n1.status_updated_by, StatusSource::Reconciler);
        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.node_id.as_deref(), Some("n2"));
        assert_eq!(w.metadata.previous_node.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_stalled_apply_times_out_with_action_history() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.agent.stall("w1");
        h.agent.record_action(crate::agent::AgentAction {
            id: "a1".to_string(),
            workload_id: "w1".to_string(),
            action: "pull".to_string(),
            status: "running".to_string(),
            message: "pulling alpine:latest".to_string(),
            timestamp: Some(Utc::now()),
        });

        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert!(!outcome.success);
        assert!(outcome.reason.contains("did not reach Running"));
        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert!(w.logs.iter().any(|l| l.contains("pulling alpine:latest")));
    }

    #[tokio::test]
    async fn test_unreachable_agent_without_target_demotes_workload() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.reconciler.reconcile_by_id("w1").await.unwrap();
        assert_eq!(
            h.store.get_workload("w1").await.unwrap().unwrap().status,
            WorkloadStatus::Running
        );

        h.agent.set_unreachable("10.0.0.1:7000", true);
        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        assert_eq!(outcome.action, ReconcileAction::AwaitFailover);

        let n1 = h.store.get_node("n1").await.unwrap().unwrap();
        assert_eq!(n1.status, NodeStatus::NotReady);
        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.node_id.as_deref(), Some("n1"));
        assert_eq!(w.status, WorkloadStatus::Unknown);
        assert!(w.retry.next_retry_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_apply_counts_against_convergence_deadline() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.agent.stall("w1");
        h.agent.set_apply_latency(Duration::from_millis(40));

        let started = Instant::now();
        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        let elapsed = started.elapsed();

        assert!(!outcome.success);
        assert!(outcome.reason.contains("did not reach Running"));
        // 50ms apply timeout in the harness
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed <= Duration::from_millis(55), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_outliving_deadline_is_a_timeout() {
        let h = harness();
        add_node(&h.store, "n1", "10.0.0.1:7000").await;
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.agent.set_apply_latency(Duration::from_secs(5));

        let started = Instant::now();
        let outcome = h.reconciler.reconcile_by_id("w1").await.unwrap().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(60), "took {elapsed:?}");
        assert_eq!(outcome.failure, Some(FailureKind::Unreachable));
        let w = h.store.get_workload("w1").await.unwrap().unwrap();
        assert_eq!(w.status, WorkloadStatus::RetryPending);
    }

    #[tokio::test]
    async fn test_frozen_store_skips_cycle() {
        let h = harness();
        h.store.put_workload(&workload("w1")).await.unwrap();
        h.store.mode().enter_degraded("test outage");

        let stats = h.reconciler.run_cycle().await.unwrap();
        assert_eq!(stats.processed, 0);
        assert!(h.reconciler.reconcile_by_id("w1").await.unwrap().is_none());
        assert!(h.agent.calls().is_empty());
    }
}
