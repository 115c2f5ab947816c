//! Shared harness: a scheduler over an in-memory store and agent fleet, with
//! the reconciler worker running so RPCs that trigger reconciles complete.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use persys_proto::scheduler::v1::{self as proto, SchedulerControl};
use persys_scheduler::{
    agent::MockAgentTransport,
    config::Config,
    grpc::ControlService,
    metrics::SchedulerMetrics,
    model::{Node, Workload},
    state::SchedulerState,
    store::MemoryBackend,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::Request;

pub const N1_ENDPOINT: &str = "10.0.0.1:7000";
pub const N2_ENDPOINT: &str = "10.0.0.2:7000";

/// Defaults with timings shrunk for tests. The periodic reconcile is pushed
/// out so only explicit triggers run it.
pub fn test_config() -> Config {
    let mut config = Config::from_lookup(|_| None).expect("default config");
    config.store.max_retries = 2;
    config.store.retry_backoff = Duration::from_millis(1);
    config.intervals.reconcile = Duration::from_secs(3600);
    config.policy.apply_wait = Duration::from_secs(2);
    config.policy.retry_base = Duration::from_millis(1);
    config.policy.retry_max = Duration::from_millis(5);
    config.agent.apply_timeout = Duration::from_millis(200);
    config.agent.converge_poll_interval = Duration::from_millis(5);
    config
}

pub struct Harness {
    pub state: SchedulerState,
    pub backend: Arc<MemoryBackend>,
    pub agent: Arc<MockAgentTransport>,
    pub service: ControlService,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl Harness {
    pub async fn start() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let agent = Arc::new(MockAgentTransport::new());
        let metrics = Arc::new(SchedulerMetrics::new().expect("metrics"));
        let (state, requests) = SchedulerState::new(test_config(), backend.clone(), agent.clone(), metrics);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(state.reconciler_worker(requests).run(shutdown_rx));
        let service = state.control_service();
        Self {
            state,
            backend,
            agent,
            service,
            shutdown,
            worker,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.worker).await;
    }

    pub async fn register(&self, node_id: &str, endpoint: &str, types: &[&str]) -> proto::RegisterNodeResponse {
        self.service
            .register_node(Request::new(proto::RegisterNodeRequest {
                node_id: node_id.to_string(),
                grpc_endpoint: endpoint.to_string(),
                cpu_total_millicores: 4000,
                memory_total_mb: 8192,
                supported_workload_types: types.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            }))
            .await
            .expect("register")
            .into_inner()
    }

    pub fn container_request(workload_id: &str, image: &str, desired: &str) -> proto::ApplyWorkloadRequest {
        proto::ApplyWorkloadRequest {
            workload_id: workload_id.to_string(),
            r#type: "container".to_string(),
            desired_state: desired.to_string(),
            resources: Some(proto::Resources {
                cpu_millicores: 250,
                memory_mb: 256,
                disk_gb: 0,
            }),
            max_attempts: 5,
            container: Some(proto::ContainerSpec {
                image: image.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub async fn apply(&self, request: proto::ApplyWorkloadRequest) -> Result<proto::ApplyWorkloadResponse, tonic::Status> {
        self.service
            .apply_workload(Request::new(request))
            .await
            .map(tonic::Response::into_inner)
    }

    pub async fn workload(&self, workload_id: &str) -> Option<Workload> {
        self.state.store().get_workload(workload_id).await.expect("get workload")
    }

    pub async fn node(&self, node_id: &str) -> Node {
        self.state
            .store()
            .get_node(node_id)
            .await
            .expect("get node")
            .expect("node registered")
    }

    /// Poll `check` every 10ms for up to two seconds.
    pub async fn eventually<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
