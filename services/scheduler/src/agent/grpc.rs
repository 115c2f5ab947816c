//! tonic client for the node agent API.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use persys_proto::agent::v1 as proto;
use persys_proto::agent::v1::AgentServiceClient;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Request;
use tracing::{debug, instrument, warn};

use super::translate::to_apply_request;
use super::{AgentAction, AgentError, AgentTransport, AgentWorkloadStatus, ApplyResult};
use crate::config::{AgentConfig, TlsConfig};
use crate::metrics::SchedulerMetrics;
use crate::model::{parse_endpoint, ActualState, DesiredState, Node, Workload};
use crate::telemetry;

/// Dial-per-call agent client.
pub struct GrpcAgentTransport {
    config: AgentConfig,
    tls: Option<ClientTlsConfig>,
    metrics: Arc<SchedulerMetrics>,
}

impl GrpcAgentTransport {
    pub fn new(config: AgentConfig, tls: Option<ClientTlsConfig>, metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            config,
            tls,
            metrics,
        }
    }

    /// Build the transport, loading client mTLS material when enabled.
    pub fn from_config(
        agent: &AgentConfig,
        tls: &TlsConfig,
        metrics: Arc<SchedulerMetrics>,
    ) -> Result<Self> {
        let client_tls = if tls.enabled {
            Some(load_client_tls(tls)?)
        } else {
            None
        };
        Ok(Self::new(agent.clone(), client_tls, metrics))
    }

    async fn connect(&self, node: &Node, timeout: Duration) -> Result<AgentServiceClient<Channel>, AgentError> {
        let (host, port) = parse_endpoint(&node.grpc_endpoint)
            .map_err(|_| AgentError::InvalidEndpoint(node.grpc_endpoint.clone()))?;
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{host}:{port}"))
            .map_err(|_| AgentError::InvalidEndpoint(node.grpc_endpoint.clone()))?
            .connect_timeout(timeout)
            .timeout(timeout);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone()).map_err(|e| AgentError::Unreachable {
                endpoint: node.grpc_endpoint.clone(),
                message: format!("tls: {e}"),
            })?;
        }

        let channel = endpoint.connect().await.map_err(|e| AgentError::Unreachable {
            endpoint: node.grpc_endpoint.clone(),
            message: e.to_string(),
        })?;
        Ok(AgentServiceClient::new(channel))
    }

    /// Dial, run one RPC under `timeout` and record latency and result code.
    async fn invoke<T, F, Fut>(
        &self,
        rpc: &'static str,
        node: &Node,
        timeout: Duration,
        call: F,
    ) -> Result<T, AgentError>
    where
        F: FnOnce(AgentServiceClient<Channel>) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, async {
            let client = self.connect(node, timeout).await?;
            call(client).await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                endpoint: node.grpc_endpoint.clone(),
                after: timeout,
            }),
        };

        let code = match &result {
            Ok(_) => "OK",
            Err(e) => e.code(),
        };
        self.metrics.record_agent_rpc(rpc, code, started.elapsed());
        if let Err(e) = &result {
            debug!(rpc, node_id = %node.node_id, error = %e, "Agent RPC failed");
        }
        result
    }
}

fn request<T>(message: T, timeout: Duration) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(timeout);
    telemetry::inject_trace_id(request.metadata_mut());
    request
}

fn convert_status(status: proto::WorkloadStatus) -> AgentWorkloadStatus {
    AgentWorkloadStatus {
        actual_state: ActualState::from_agent(status.actual_state().as_str_name()),
        id: status.id,
        revision_id: Some(status.revision_id).filter(|r| !r.is_empty()),
        message: Some(status.message).filter(|m| !m.is_empty()),
    }
}

fn convert_action(action: proto::AgentAction) -> AgentAction {
    AgentAction {
        id: action.id,
        workload_id: action.workload_id,
        action: action.action,
        status: action.status,
        message: action.message,
        timestamp: Utc.timestamp_opt(action.timestamp_unix, 0).single(),
    }
}

#[async_trait]
impl AgentTransport for GrpcAgentTransport {
    #[instrument(
        skip(self, node, workload),
        fields(node_id = %node.node_id, workload_id = %workload.id, workload_type = %workload.workload_type())
    )]
    async fn apply_workload(
        &self,
        node: &Node,
        workload: &Workload,
        desired: DesiredState,
    ) -> Result<ApplyResult, AgentError> {
        let message = to_apply_request(workload, desired)?;
        let workload_type = workload.workload_type();
        let timeout = self.config.apply_timeout_for(workload_type);
        let endpoint = node.grpc_endpoint.clone();
        let workload_id = workload.id.clone();

        self.invoke("ApplyWorkload", node, timeout, |mut client| async move {
            let response = client
                .apply_workload(request(message, timeout))
                .await
                .map_err(|s| AgentError::from_status(&endpoint, &workload_id, Some(workload_type), s))?
                .into_inner();

            if !response.applied && !response.skipped {
                let reason = response.failure_reason();
                return Err(AgentError::from_rejection(workload_type, reason, response.message));
            }
            Ok(ApplyResult {
                applied: response.applied,
                skipped: response.skipped,
                message: response.message,
                status: response.status.map(convert_status),
            })
        })
        .await
    }

    #[instrument(skip(self, node), fields(node_id = %node.node_id))]
    async fn get_workload_status(
        &self,
        node: &Node,
        workload_id: &str,
    ) -> Result<AgentWorkloadStatus, AgentError> {
        let timeout = self.config.status_timeout;
        let endpoint = node.grpc_endpoint.clone();
        let id = workload_id.to_string();

        self.invoke("GetWorkloadStatus", node, timeout, |mut client| async move {
            let response = client
                .get_workload_status(request(
                    proto::GetWorkloadStatusRequest { id: id.clone() },
                    timeout,
                ))
                .await
                .map_err(|s| AgentError::from_status(&endpoint, &id, None, s))?
                .into_inner();
            response
                .status
                .map(convert_status)
                .ok_or(AgentError::NotFound(id))
        })
        .await
    }

    #[instrument(skip(self, node), fields(node_id = %node.node_id))]
    async fn delete_workload(&self, node: &Node, workload_id: &str) -> Result<bool, AgentError> {
        let timeout = self.config.delete_timeout;
        let endpoint = node.grpc_endpoint.clone();
        let id = workload_id.to_string();

        let result = self
            .invoke("DeleteWorkload", node, timeout, |mut client| async move {
                let response = client
                    .delete_workload(request(
                        proto::DeleteWorkloadRequest { id: id.clone() },
                        timeout,
                    ))
                    .await
                    .map_err(|s| AgentError::from_status(&endpoint, &id, None, s))?
                    .into_inner();
                if !response.applied && !response.message.is_empty() {
                    warn!(workload_id = %id, message = %response.message, "Agent did not apply delete");
                }
                Ok(true)
            })
            .await;

        match result {
            Err(AgentError::NotFound(_)) => Ok(false),
            other => other,
        }
    }

    #[instrument(skip(self, node), fields(node_id = %node.node_id))]
    async fn list_workloads(&self, node: &Node) -> Result<Vec<AgentWorkloadStatus>, AgentError> {
        let timeout = self.config.status_timeout;
        let endpoint = node.grpc_endpoint.clone();

        self.invoke("ListWorkloads", node, timeout, |mut client| async move {
            let response = client
                .list_workloads(request(proto::ListWorkloadsRequest {}, timeout))
                .await
                .map_err(|s| AgentError::from_status(&endpoint, "", None, s))?
                .into_inner();
            Ok(response.workloads.into_iter().map(convert_status).collect())
        })
        .await
    }

    #[instrument(skip(self, node), fields(node_id = %node.node_id))]
    async fn list_actions(
        &self,
        node: &Node,
        workload_id: &str,
        newest_first: bool,
        limit: u32,
    ) -> Result<Vec<AgentAction>, AgentError> {
        let timeout = self.config.status_timeout;
        let endpoint = node.grpc_endpoint.clone();
        let id = workload_id.to_string();

        self.invoke("ListActions", node, timeout, |mut client| async move {
            let response = client
                .list_actions(request(
                    proto::ListActionsRequest {
                        workload_id: id.clone(),
                        newest_first,
                        limit,
                    },
                    timeout,
                ))
                .await
                .map_err(|s| AgentError::from_status(&endpoint, &id, None, s))?
                .into_inner();
            Ok(response.actions.into_iter().map(convert_action).collect())
        })
        .await
    }
}

fn load_client_tls(tls: &TlsConfig) -> Result<ClientTlsConfig> {
    let read = |path: &Option<std::path::PathBuf>, what: &str| -> Result<Vec<u8>> {
        let path = path
            .as_ref()
            .with_context(|| format!("TLS is enabled but no {what} path is set"))?;
        std::fs::read(path).with_context(|| format!("failed to read {what} from {}", path.display()))
    };
    let cert = read(&tls.cert_path, "certificate")?;
    let key = read(&tls.key_path, "private key")?;
    let ca = read(&tls.ca_path, "CA bundle")?;

    Ok(ClientTlsConfig::new()
        .domain_name(tls.agent_domain.clone())
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key)))
}
