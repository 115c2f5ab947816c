use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use persys_events::{EventType, SchedulerEvent};
use persys_proto::scheduler::v1::{self as proto, SchedulerControl};
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{convert, store_status};
use crate::config::PolicyConfig;
use crate::discovery::DiscoveryPublisher;
use crate::metrics::SchedulerMetrics;
use crate::model::{
    generate_workload_id, parse_endpoint, ActualState, DesiredState, Node, NodeStatus,
    StatusSource, Workload, WorkloadStatus, WorkloadType,
};
use crate::node_health::MISSED_HEARTBEATS;
use crate::scheduler::{FailureKind, ReconcileHandle};
use crate::store::StateStore;
use crate::telemetry::{trace_id_from_metadata, with_trace_id};

/// Lease handed back on every heartbeat.
const HEARTBEAT_LEASE: Duration = Duration::from_secs(180);

fn lease_span(span: Duration) -> chrono::Duration {
    chrono::Duration::seconds(span.as_secs() as i64)
}

type ControlMessageStream = Pin<Box<dyn Stream<Item = Result<proto::ControlMessage, Status>> + Send>>;

pub struct ControlService {
    store: StateStore,
    reconcile: ReconcileHandle,
    discovery: DiscoveryPublisher,
    metrics: Arc<SchedulerMetrics>,
    heartbeat_interval: Duration,
    policy: PolicyConfig,
}

impl ControlService {
    pub fn new(
        store: StateStore,
        reconcile: ReconcileHandle,
        discovery: DiscoveryPublisher,
        metrics: Arc<SchedulerMetrics>,
        heartbeat_interval: Duration,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            reconcile,
            discovery,
            metrics,
            heartbeat_interval,
            policy,
        }
    }

    /// Run one handler inside its trace scope and record the result.
    async fn serve<T, F>(&self, method: &'static str, trace_id: String, handler: F) -> Result<Response<T>, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        let started = Instant::now();
        let span = info_span!("grpc", method, trace_id = %trace_id);
        let result = with_trace_id(trace_id, handler).instrument(span.clone()).await;

        let code = match &result {
            Ok(_) => tonic::Code::Ok,
            Err(status) => status.code(),
        };
        self.metrics
            .record_grpc(method, &format!("{code:?}"), started.elapsed());
        if let Err(status) = &result {
            span.in_scope(|| match status.code() {
                tonic::Code::Internal | tonic::Code::Unavailable => {
                    warn!(code = ?status.code(), message = status.message(), "RPC failed")
                }
                _ => debug!(code = ?status.code(), message = status.message(), "RPC rejected"),
            });
        }
        result.map(Response::new)
    }

    fn ensure_writable(&self) -> Result<(), Status> {
        match self.store.mode().write_block() {
            Some((mode, reason)) => Err(Status::unavailable(format!(
                "control plane frozen ({mode}): {reason}"
            ))),
            None => Ok(()),
        }
    }

    /// Nodes for read RPCs: the frozen snapshot while writes are frozen.
    async fn nodes_view(&self) -> Result<Vec<Node>, Status> {
        if let Some(frozen) = self.store.mode().frozen() {
            return Ok(frozen.nodes.clone());
        }
        self.store.list_nodes().await.map_err(store_status)
    }

    async fn workloads_view(&self) -> Result<Vec<Workload>, Status> {
        if let Some(frozen) = self.store.mode().frozen() {
            return Ok(frozen.workloads.clone());
        }
        self.store.list_workloads().await.map_err(store_status)
    }

    async fn register(&self, req: proto::RegisterNodeRequest) -> Result<proto::RegisterNodeResponse, Status> {
        self.ensure_writable()?;
        let node_id = req.node_id.trim();
        if node_id.is_empty() {
            return Err(Status::invalid_argument("node_id must not be empty"));
        }
        parse_endpoint(&req.grpc_endpoint).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let mut types = BTreeSet::new();
        for raw in &req.supported_workload_types {
            let workload_type = WorkloadType::canonicalize(raw)
                .ok_or_else(|| Status::invalid_argument(format!("unknown workload type {raw:?}")))?;
            types.insert(workload_type);
        }

        let now = Utc::now();
        let previous = self.store.get_node(node_id).await.map_err(store_status)?;
        let mut node = Node::register(node_id, req.grpc_endpoint.trim(), req.cpu_total_millicores, req.memory_total_mb, now);
        node.cluster_id = Some(req.cluster_id).filter(|c| !c.is_empty());
        node.supported_workload_types = (!types.is_empty()).then_some(types);
        node.hypervisor = Some(req.hypervisor).filter(|h| !h.trim().is_empty());
        node.labels = req.labels.into_iter().collect();
        if let Some(previous) = &previous {
            node.registered_at = previous.registered_at;
            node.status_reason = "re-registered".to_string();
        }

        self.store.put_node(&node).await.map_err(store_status)?;
        info!(
            node_id = %node.node_id,
            endpoint = %node.grpc_endpoint,
            legacy = node.is_legacy(),
            reregistered = previous.is_some(),
            "Node registered"
        );
        self.store
            .record_event(
                SchedulerEvent::builder(EventType::NodeRegistered)
                    .node(node.node_id.clone())
                    .reason(node.status_reason.clone())
                    .detail("endpoint", node.grpc_endpoint.clone())
                    .timestamp(now),
            )
            .await;
        if let Err(e) = self.discovery.publish_node(&node).await {
            warn!(node_id = %node.node_id, error = %e, "Failed to publish node discovery record");
        }

        let lease = now + lease_span(self.heartbeat_interval * MISSED_HEARTBEATS);
        Ok(proto::RegisterNodeResponse {
            accepted: true,
            heartbeat_interval_seconds: self.heartbeat_interval.as_secs() as u32,
            lease_expires_at_unix: lease.timestamp(),
            message: format!("registered {}", node.node_id),
        })
    }

    async fn heartbeat_inner(&self, req: proto::HeartbeatRequest) -> Result<proto::HeartbeatResponse, Status> {
        self.ensure_writable()?;
        if req.node_id.trim().is_empty() {
            return Err(Status::invalid_argument("node_id must not be empty"));
        }
        let now = Utc::now();
        let mut node = self
            .store
            .get_node(&req.node_id)
            .await
            .map_err(store_status)?
            .ok_or_else(|| Status::not_found(format!("node {} is not registered", req.node_id)))?;

        node.apply_usage(req.cpu_used_millicores, req.memory_used_mb);
        node.record_heartbeat(now);
        if !node.is_ready() {
            info!(node_id = %node.node_id, previous_reason = %node.status_reason, "Node is heartbeating again");
            node.mark_ready(StatusSource::Heartbeat, "heartbeat resumed", now);
        }
        self.store.put_node(&node).await.map_err(store_status)?;

        for report in req.workloads {
            self.ingest(&node, report).await?;
        }

        let lease = now + lease_span(HEARTBEAT_LEASE);
        Ok(proto::HeartbeatResponse {
            acknowledged: true,
            drain: false,
            lease_expires_at_unix: lease.timestamp(),
        })
    }

    /// Fold one heartbeat workload report into the workload record. Only the
    /// assigned node's reports count, and bookkeeping statuses are left to
    /// the reconciler.
    async fn ingest(&self, node: &Node, report: proto::WorkloadReport) -> Result<(), Status> {
        let Some(mut workload) = self
            .store
            .get_workload(&report.workload_id)
            .await
            .map_err(store_status)?
        else {
            debug!(workload_id = %report.workload_id, "Heartbeat reports an unknown workload");
            return Ok(());
        };
        if workload.node_id.as_deref() != Some(node.node_id.as_str()) {
            return Ok(());
        }

        let now = Utc::now();
        let before = workload.clone();
        let actual = ActualState::from_agent(&report.actual_state);
        workload.status_info.actual_state = Some(actual);
        if workload.status.is_observed() && workload.desired_state != DesiredState::Deleted {
            let status = actual.to_status();
            if workload.status != status {
                workload.set_status(status, now);
            }
        }
        if !report.message.is_empty() && workload.logs.last() != Some(&report.message) {
            workload.append_log(report.message);
        }
        for line in report.logs {
            workload.append_log(line);
        }

        if workload != before {
            workload.touch(now);
            self.store.put_workload(&workload).await.map_err(store_status)?;
        }
        Ok(())
    }

    async fn delete_node_inner(&self, req: proto::DeleteNodeRequest) -> Result<proto::DeleteNodeResponse, Status> {
        self.ensure_writable()?;
        if req.node_id.trim().is_empty() {
            return Err(Status::invalid_argument("node_id must not be empty"));
        }
        let deleted = self.store.delete_node(&req.node_id).await.map_err(store_status)?;
        if deleted {
            if let Err(e) = self.discovery.withdraw_node(&req.node_id).await {
                warn!(node_id = %req.node_id, error = %e, "Failed to withdraw node discovery record");
            }
            info!(node_id = %req.node_id, "Node deleted");
            self.store
                .record_event(
                    SchedulerEvent::builder(EventType::NodeRemoved)
                        .node(req.node_id.clone())
                        .reason("deleted by operator"),
                )
                .await;
        }
        Ok(proto::DeleteNodeResponse { deleted })
    }

    async fn apply(&self, req: proto::ApplyWorkloadRequest) -> Result<proto::ApplyWorkloadResponse, Status> {
        self.ensure_writable()?;
        let spec = convert::spec_from_request(&req).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let workload_id = match req.workload_id.trim() {
            "" => generate_workload_id(),
            id => id.to_string(),
        };
        let desired = DesiredState::canonicalize(&req.desired_state);
        let now = Utc::now();

        let workload = match self.store.get_workload(&workload_id).await.map_err(store_status)? {
            Some(mut existing) => {
                let mut changed = existing.update(spec, desired, now);
                if req.max_attempts > 0 && req.max_attempts != existing.retry.max_attempts {
                    existing.retry.max_attempts = req.max_attempts;
                    existing.retry.attempts = existing.retry.attempts.min(req.max_attempts);
                    changed = true;
                }
                if changed {
                    existing.append_log(format!("updated: desired {desired}, revision {}", existing.revision_id));
                    self.store.put_workload(&existing).await.map_err(store_status)?;
                    info!(workload_id = %workload_id, revision = %existing.revision_id, "Workload updated");
                }
                existing
            }
            None => {
                let max_attempts = if req.max_attempts > 0 {
                    req.max_attempts
                } else {
                    self.policy.max_attempts
                };
                let workload = Workload::new(workload_id.clone(), spec, desired, max_attempts, now);
                self.store.put_workload(&workload).await.map_err(store_status)?;
                info!(
                    workload_id = %workload_id,
                    workload_type = %workload.workload_type(),
                    revision = %workload.revision_id,
                    "Workload created"
                );
                workload
            }
        };

        let outcome = self
            .reconcile
            .trigger_and_wait(&workload_id, self.policy.apply_wait)
            .await;
        let current = self
            .store
            .get_workload(&workload_id)
            .await
            .map_err(store_status)?
            .unwrap_or(workload);

        let mut response = proto::ApplyWorkloadResponse {
            success: true,
            workload_id,
            revision_id: current.revision_id.clone(),
            status: current.status.as_str().to_string(),
            failure_reason: String::new(),
            message: "accepted; reconciliation pending".to_string(),
        };
        if let Some(outcome) = outcome {
            response.message = outcome.reason;
            match outcome.failure {
                Some(FailureKind::InvalidSpec) => {
                    response.success = false;
                    response.failure_reason = "INVALID_SPEC".to_string();
                }
                Some(FailureKind::Runtime) => {
                    response.success = false;
                    response.failure_reason = "RUNTIME_ERROR".to_string();
                }
                // accepted; placement and connectivity resolve on later cycles
                Some(FailureKind::Placement) | Some(FailureKind::Unreachable) | None => {}
            }
        }
        Ok(response)
    }

    async fn delete_workload_inner(
        &self,
        req: proto::DeleteWorkloadRequest,
    ) -> Result<proto::DeleteWorkloadResponse, Status> {
        self.ensure_writable()?;
        if req.workload_id.trim().is_empty() {
            return Err(Status::invalid_argument("workload_id must not be empty"));
        }
        let Some(mut workload) = self
            .store
            .get_workload(&req.workload_id)
            .await
            .map_err(store_status)?
        else {
            return Ok(proto::DeleteWorkloadResponse {
                accepted: true,
                message: "workload not found".to_string(),
            });
        };

        if workload.desired_state != DesiredState::Deleted {
            let spec = workload.spec.clone();
            workload.update(spec, DesiredState::Deleted, Utc::now());
            workload.append_log("delete requested");
            self.store.put_workload(&workload).await.map_err(store_status)?;
            info!(workload_id = %workload.id, "Workload marked for deletion");
        }
        self.reconcile.trigger(&workload.id);
        Ok(proto::DeleteWorkloadResponse {
            accepted: true,
            message: "deletion in progress".to_string(),
        })
    }

    async fn retry(&self, req: proto::RetryWorkloadRequest) -> Result<proto::RetryWorkloadResponse, Status> {
        self.ensure_writable()?;
        let mut workload = self
            .store
            .get_workload(&req.workload_id)
            .await
            .map_err(store_status)?
            .ok_or_else(|| Status::not_found(format!("workload {} not found", req.workload_id)))?;

        let now = Utc::now();
        if workload.status == WorkloadStatus::Failed && workload.retry.is_exhausted() {
            workload.retry.attempts = 0;
        }
        workload.retry.next_retry_at = Some(now);
        workload.append_log("retry requested");
        workload.touch(now);
        self.store.put_workload(&workload).await.map_err(store_status)?;
        self.store
            .put_retry(&crate::model::RetryRecord::from_workload(&workload))
            .await
            .map_err(store_status)?;
        self.reconcile.trigger(&workload.id);
        info!(workload_id = %workload.id, "Retry requested");

        Ok(proto::RetryWorkloadResponse {
            accepted: true,
            next_retry_at_unix: now.timestamp(),
        })
    }

    async fn list_nodes_inner(&self, req: proto::ListNodesRequest) -> Result<proto::ListNodesResponse, Status> {
        let filter = match req.status.trim() {
            "" => None,
            raw => Some(
                NodeStatus::parse(raw)
                    .ok_or_else(|| Status::invalid_argument(format!("unknown node status {raw:?}")))?,
            ),
        };
        let nodes = self
            .nodes_view()
            .await?
            .iter()
            .filter(|n| filter.is_none_or(|s| n.status == s))
            .map(convert::node_info)
            .collect();
        Ok(proto::ListNodesResponse { nodes })
    }

    async fn get_node_inner(&self, req: proto::GetNodeRequest) -> Result<proto::GetNodeResponse, Status> {
        let node = self
            .nodes_view()
            .await?
            .into_iter()
            .find(|n| n.node_id == req.node_id)
            .ok_or_else(|| Status::not_found(format!("node {} not found", req.node_id)))?;
        Ok(proto::GetNodeResponse {
            node: Some(convert::node_info(&node)),
        })
    }

    async fn list_workloads_inner(
        &self,
        req: proto::ListWorkloadsRequest,
    ) -> Result<proto::ListWorkloadsResponse, Status> {
        let status = match req.status.trim() {
            "" => None,
            raw => Some(
                WorkloadStatus::parse(raw)
                    .ok_or_else(|| Status::invalid_argument(format!("unknown workload status {raw:?}")))?,
            ),
        };
        let desired = req.desired_state.trim();
        let node_id = req.node_id.trim();
        let workloads = self
            .workloads_view()
            .await?
            .iter()
            .filter(|w| status.is_none_or(|s| w.status == s))
            .filter(|w| node_id.is_empty() || w.node_id.as_deref() == Some(node_id))
            .filter(|w| desired.is_empty() || w.desired_state.as_str().eq_ignore_ascii_case(desired))
            .map(convert::workload_info)
            .collect();
        Ok(proto::ListWorkloadsResponse { workloads })
    }

    async fn get_workload_inner(&self, req: proto::GetWorkloadRequest) -> Result<proto::GetWorkloadResponse, Status> {
        let workload = self
            .workloads_view()
            .await?
            .into_iter()
            .find(|w| w.id == req.workload_id)
            .ok_or_else(|| Status::not_found(format!("workload {} not found", req.workload_id)))?;
        Ok(proto::GetWorkloadResponse {
            workload: Some(convert::workload_info(&workload)),
        })
    }

    async fn summary(&self) -> Result<proto::GetClusterSummaryResponse, Status> {
        let nodes = self.nodes_view().await?;
        let workloads = self.workloads_view().await?;
        Ok(convert::cluster_summary(&nodes, &workloads, self.store.mode().mode()))
    }
}

#[tonic::async_trait]
impl SchedulerControl for ControlService {
    async fn register_node(
        &self,
        request: Request<proto::RegisterNodeRequest>,
    ) -> Result<Response<proto::RegisterNodeResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("RegisterNode", trace_id, self.register(request.into_inner()))
            .await
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("Heartbeat", trace_id, self.heartbeat_inner(request.into_inner()))
            .await
    }

    async fn delete_node(
        &self,
        request: Request<proto::DeleteNodeRequest>,
    ) -> Result<Response<proto::DeleteNodeResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("DeleteNode", trace_id, self.delete_node_inner(request.into_inner()))
            .await
    }

    async fn apply_workload(
        &self,
        request: Request<proto::ApplyWorkloadRequest>,
    ) -> Result<Response<proto::ApplyWorkloadResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("ApplyWorkload", trace_id, self.apply(request.into_inner()))
            .await
    }

    async fn delete_workload(
        &self,
        request: Request<proto::DeleteWorkloadRequest>,
    ) -> Result<Response<proto::DeleteWorkloadResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("DeleteWorkload", trace_id, self.delete_workload_inner(request.into_inner()))
            .await
    }

    async fn retry_workload(
        &self,
        request: Request<proto::RetryWorkloadRequest>,
    ) -> Result<Response<proto::RetryWorkloadResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("RetryWorkload", trace_id, self.retry(request.into_inner()))
            .await
    }

    async fn list_nodes(
        &self,
        request: Request<proto::ListNodesRequest>,
    ) -> Result<Response<proto::ListNodesResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("ListNodes", trace_id, self.list_nodes_inner(request.into_inner()))
            .await
    }

    async fn get_node(
        &self,
        request: Request<proto::GetNodeRequest>,
    ) -> Result<Response<proto::GetNodeResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("GetNode", trace_id, self.get_node_inner(request.into_inner()))
            .await
    }

    async fn list_workloads(
        &self,
        request: Request<proto::ListWorkloadsRequest>,
    ) -> Result<Response<proto::ListWorkloadsResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("ListWorkloads", trace_id, self.list_workloads_inner(request.into_inner()))
            .await
    }

    async fn get_workload(
        &self,
        request: Request<proto::GetWorkloadRequest>,
    ) -> Result<Response<proto::GetWorkloadResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("GetWorkload", trace_id, self.get_workload_inner(request.into_inner()))
            .await
    }

    async fn get_cluster_summary(
        &self,
        request: Request<proto::GetClusterSummaryRequest>,
    ) -> Result<Response<proto::GetClusterSummaryResponse>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("GetClusterSummary", trace_id, self.summary()).await
    }

    type ControlStreamStream = ControlMessageStream;

    async fn control_stream(
        &self,
        request: Request<Streaming<proto::ControlMessage>>,
    ) -> Result<Response<Self::ControlStreamStream>, Status> {
        let trace_id = trace_id_from_metadata(request.metadata());
        self.serve("ControlStream", trace_id, async {
            Err(Status::unimplemented("control stream is reserved"))
        })
        .await
    }
}
