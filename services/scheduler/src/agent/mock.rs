//! In-memory agent fleet for tests and local runs.
//!
//! Workloads are hosted per agent endpoint, so two node records sharing an
//! endpoint see the same agent. Failures are scripted per workload.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::translate::to_apply_request;
use super::{AgentAction, AgentError, AgentTransport, AgentWorkloadStatus, ApplyResult};
use crate::model::{ActualState, DesiredState, Node, Workload};

/// A workload as one mock agent holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedWorkload {
    pub actual_state: ActualState,
    pub revision_id: String,
    pub message: Option<String>,
}

/// A call the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Apply {
        node_id: String,
        workload_id: String,
        desired: DesiredState,
        revision_id: String,
    },
    Status {
        node_id: String,
        workload_id: String,
    },
    Delete {
        node_id: String,
        workload_id: String,
    },
    List {
        node_id: String,
    },
    Actions {
        node_id: String,
        workload_id: String,
    },
}

#[derive(Default)]
struct MockState {
    hosted: HashMap<String, BTreeMap<String, HostedWorkload>>,
    unreachable: HashSet<String>,
    apply_failures: HashMap<String, VecDeque<AgentError>>,
    sticky_failures: HashMap<String, AgentError>,
    /// Workloads whose apply is accepted but stays Pending.
    stalled: HashSet<String>,
    /// Time every apply spends before answering.
    apply_latency: Option<Duration>,
    actions: HashMap<String, Vec<AgentAction>>,
    calls: Vec<AgentCall>,
}

#[derive(Default)]
pub struct MockAgentTransport {
    state: Mutex<MockState>,
}

impl MockAgentTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a workload on the agent at `endpoint` out of band.
    pub fn host(&self, endpoint: &str, workload_id: &str, actual_state: ActualState, revision_id: &str) {
        self.lock().hosted.entry(endpoint.to_string()).or_default().insert(
            workload_id.to_string(),
            HostedWorkload {
                actual_state,
                revision_id: revision_id.to_string(),
                message: None,
            },
        );
    }

    /// Remove a workload from the agent out of band.
    pub fn evict(&self, endpoint: &str, workload_id: &str) {
        if let Some(hosted) = self.lock().hosted.get_mut(endpoint) {
            hosted.remove(workload_id);
        }
    }

    pub fn hosted(&self, endpoint: &str) -> BTreeMap<String, HostedWorkload> {
        self.lock().hosted.get(endpoint).cloned().unwrap_or_default()
    }

    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(endpoint.to_string());
        } else {
            state.unreachable.remove(endpoint);
        }
    }

    /// Fail the next apply of `workload_id` with `error`.
    pub fn fail_next_apply(&self, workload_id: &str, error: AgentError) {
        self.lock()
            .apply_failures
            .entry(workload_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail every apply of `workload_id` until cleared.
    pub fn fail_applies(&self, workload_id: &str, error: AgentError) {
        self.lock()
            .sticky_failures
            .insert(workload_id.to_string(), error);
    }

    pub fn clear_failures(&self, workload_id: &str) {
        let mut state = self.lock();
        state.apply_failures.remove(workload_id);
        state.sticky_failures.remove(workload_id);
    }

    /// Accept applies of `workload_id` but leave it Pending.
    pub fn stall(&self, workload_id: &str) {
        self.lock().stalled.insert(workload_id.to_string());
    }

    pub fn set_apply_latency(&self, latency: Duration) {
        self.lock().apply_latency = Some(latency);
    }

    pub fn record_action(&self, action: AgentAction) {
        self.lock()
            .actions
            .entry(action.workload_id.clone())
            .or_default()
            .push(action);
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn apply_count(&self, workload_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, AgentCall::Apply { workload_id: id, .. } if id == workload_id))
            .count()
    }

    pub fn delete_count(&self, workload_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, AgentCall::Delete { workload_id: id, .. } if id == workload_id))
            .count()
    }

    fn check_reachable(state: &MockState, node: &Node) -> Result<(), AgentError> {
        if state.unreachable.contains(&node.grpc_endpoint) {
            return Err(AgentError::Unreachable {
                endpoint: node.grpc_endpoint.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

fn status_of(id: &str, hosted: &HostedWorkload) -> AgentWorkloadStatus {
    AgentWorkloadStatus {
        id: id.to_string(),
        actual_state: hosted.actual_state,
        revision_id: Some(hosted.revision_id.clone()).filter(|r| !r.is_empty()),
        message: hosted.message.clone(),
    }
}

#[async_trait]
impl AgentTransport for MockAgentTransport {
    async fn apply_workload(
        &self,
        node: &Node,
        workload: &Workload,
        desired: DesiredState,
    ) -> Result<ApplyResult, AgentError> {
        let latency = self.lock().apply_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let request = to_apply_request(workload, desired)?;
        let mut state = self.lock();
        state.calls.push(AgentCall::Apply {
            node_id: node.node_id.clone(),
            workload_id: workload.id.clone(),
            desired,
            revision_id: request.revision_id.clone(),
        });
        Self::check_reachable(&state, node)?;

        if let Some(error) = state
            .apply_failures
            .get_mut(&workload.id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = state.sticky_failures.get(&workload.id) {
            return Err(error.clone());
        }

        let target = if state.stalled.contains(&workload.id) {
            ActualState::Pending
        } else if desired == DesiredState::Stopped {
            ActualState::Stopped
        } else {
            ActualState::Running
        };
        let hosted = state.hosted.entry(node.grpc_endpoint.clone()).or_default();
        let skipped = hosted
            .get(&workload.id)
            .is_some_and(|h| h.revision_id == request.revision_id && h.actual_state == target);
        let entry = HostedWorkload {
            actual_state: target,
            revision_id: request.revision_id,
            message: None,
        };
        let status = status_of(&workload.id, &entry);
        hosted.insert(workload.id.clone(), entry);

        Ok(ApplyResult {
            applied: !skipped,
            skipped,
            message: if skipped { "already converged" } else { "applied" }.to_string(),
            status: Some(status),
        })
    }

    async fn get_workload_status(
        &self,
        node: &Node,
        workload_id: &str,
    ) -> Result<AgentWorkloadStatus, AgentError> {
        let mut state = self.lock();
        state.calls.push(AgentCall::Status {
            node_id: node.node_id.clone(),
            workload_id: workload_id.to_string(),
        });
        Self::check_reachable(&state, node)?;
        state
            .hosted
            .get(&node.grpc_endpoint)
            .and_then(|h| h.get(workload_id))
            .map(|h| status_of(workload_id, h))
            .ok_or_else(|| AgentError::NotFound(workload_id.to_string()))
    }

    async fn delete_workload(&self, node: &Node, workload_id: &str) -> Result<bool, AgentError> {
        let mut state = self.lock();
        state.calls.push(AgentCall::Delete {
            node_id: node.node_id.clone(),
            workload_id: workload_id.to_string(),
        });
        Self::check_reachable(&state, node)?;
        Ok(state
            .hosted
            .get_mut(&node.grpc_endpoint)
            .and_then(|h| h.remove(workload_id))
            .is_some())
    }

    async fn list_workloads(&self, node: &Node) -> Result<Vec<AgentWorkloadStatus>, AgentError> {
        let mut state = self.lock();
        state.calls.push(AgentCall::List {
            node_id: node.node_id.clone(),
        });
        Self::check_reachable(&state, node)?;
        Ok(state
            .hosted
            .get(&node.grpc_endpoint)
            .map(|h| h.iter().map(|(id, w)| status_of(id, w)).collect())
            .unwrap_or_default())
    }

    async fn list_actions(
        &self,
        node: &Node,
        workload_id: &str,
        newest_first: bool,
        limit: u32,
    ) -> Result<Vec<AgentAction>, AgentError> {
        let mut state = self.lock();
        state.calls.push(AgentCall::Actions {
            node_id: node.node_id.clone(),
            workload_id: workload_id.to_string(),
        });
        Self::check_reachable(&state, node)?;
        let mut actions = state.actions.get(workload_id).cloned().unwrap_or_default();
        actions.sort_by_key(|a| a.timestamp.unwrap_or_else(Utc::now));
        if newest_first {
            actions.reverse();
        }
        actions.truncate(limit as usize);
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerSpec, WorkloadSpec};

    fn workload() -> Workload {
        let spec = WorkloadSpec::container(ContainerSpec {
            image: "alpine:latest".to_string(),
            ..Default::default()
        });
        Workload::new("w1", spec, DesiredState::Running, 5, Utc::now())
    }

    #[tokio::test]
    async fn test_second_apply_is_skipped() {
        let agent = MockAgentTransport::new();
        let node = Node::register("n1", "10.0.0.1:7000", 1000, 1024, Utc::now());
        let w = workload();

        let first = agent.apply_workload(&node, &w, DesiredState::Running).await.unwrap();
        let second = agent.apply_workload(&node, &w, DesiredState::Running).await.unwrap();
        assert!(first.applied && !first.skipped);
        assert!(second.skipped);
        assert_eq!(agent.hosted("10.0.0.1:7000").len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let agent = MockAgentTransport::new();
        let node = Node::register("n1", "10.0.0.1:7000", 1000, 1024, Utc::now());
        agent.fail_next_apply(
            "w1",
            AgentError::Runtime {
                category: "pull".to_string(),
                message: "image not found".to_string(),
            },
        );
        assert!(agent.apply_workload(&node, &workload(), DesiredState::Running).await.is_err());
        assert!(agent.apply_workload(&node, &workload(), DesiredState::Running).await.is_ok());
        assert_eq!(agent.apply_count("w1"), 2);
    }

    #[tokio::test]
    async fn test_unreachable_and_not_found() {
        let agent = MockAgentTransport::new();
        let node = Node::register("n1", "10.0.0.1:7000", 1000, 1024, Utc::now());
        assert!(agent.get_workload_status(&node, "w1").await.unwrap_err().is_not_found());
        assert!(!agent.delete_workload(&node, "w1").await.unwrap());

        agent.set_unreachable("10.0.0.1:7000", true);
        assert!(agent.list_workloads(&node).await.unwrap_err().is_unreachable());
    }
}
