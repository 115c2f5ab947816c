//! Shared scheduler state and the factories for its long-running tasks.

use std::sync::Arc;

use crate::agent::AgentTransport;
use crate::api::ApiState;
use crate::config::Config;
use crate::discovery::DiscoveryPublisher;
use crate::drift::DriftDetector;
use crate::grpc::ControlService;
use crate::metrics::SchedulerMetrics;
use crate::mode::{ModeController, ModeSupervisor};
use crate::monitor::Monitor;
use crate::node_health::NodeHealthMonitor;
use crate::scheduler::{ReconcileHandle, ReconcileRequests, Reconciler, ReconcilerWorker};
use crate::store::{ClusterCache, KvBackend, RetryPolicy, StateStore};

/// Everything the scheduler's tasks and servers share.
#[derive(Clone)]
pub struct SchedulerState {
    inner: Arc<SchedulerStateInner>,
}

struct SchedulerStateInner {
    config: Config,
    store: StateStore,
    agent: Arc<dyn AgentTransport>,
    metrics: Arc<SchedulerMetrics>,
    reconcile: ReconcileHandle,
    discovery: DiscoveryPublisher,
}

impl SchedulerState {
    /// Wire the store, mode controller and reconcile channel together.
    ///
    /// The returned receiver feeds the one [`ReconcilerWorker`].
    pub fn new(
        config: Config,
        backend: Arc<dyn KvBackend>,
        agent: Arc<dyn AgentTransport>,
        metrics: Arc<SchedulerMetrics>,
    ) -> (Self, ReconcileRequests) {
        let mode = Arc::new(ModeController::new(Arc::new(ClusterCache::new())));
        let store = StateStore::new(
            backend,
            mode,
            RetryPolicy {
                attempts: config.store.max_retries,
                backoff: config.store.retry_backoff,
            },
        );
        let (reconcile, requests) = ReconcileHandle::channel();
        let discovery = DiscoveryPublisher::new(store.clone(), &config.discovery, config.grpc_port);

        let state = Self {
            inner: Arc::new(SchedulerStateInner {
                config,
                store,
                agent,
                metrics,
                reconcile,
                discovery,
            }),
        };
        (state, requests)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn mode(&self) -> &Arc<ModeController> {
        self.inner.store.mode()
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.inner.metrics
    }

    pub fn reconcile_handle(&self) -> ReconcileHandle {
        self.inner.reconcile.clone()
    }

    pub fn discovery(&self) -> &DiscoveryPublisher {
        &self.inner.discovery
    }

    pub fn reconciler(&self) -> Reconciler {
        let config = self.config();
        Reconciler::new(
            self.store().clone(),
            self.inner.agent.clone(),
            self.metrics().clone(),
            config.policy.clone(),
            config.agent.clone(),
        )
    }

    pub fn reconciler_worker(&self, requests: ReconcileRequests) -> ReconcilerWorker {
        ReconcilerWorker::new(self.reconciler(), self.config().intervals.reconcile, requests)
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            self.store().clone(),
            self.inner.agent.clone(),
            self.metrics().clone(),
            self.config().intervals.monitor,
        )
    }

    pub fn drift_detector(&self) -> DriftDetector {
        let config = self.config();
        DriftDetector::new(
            self.store().clone(),
            self.inner.agent.clone(),
            self.reconcile_handle(),
            self.metrics().clone(),
            config.intervals.drift,
            config.policy.node_unavailable_grace,
        )
    }

    pub fn node_health(&self) -> NodeHealthMonitor {
        NodeHealthMonitor::new(
            self.store().clone(),
            self.metrics().clone(),
            self.config().intervals.heartbeat,
        )
    }

    pub fn mode_supervisor(&self) -> ModeSupervisor {
        ModeSupervisor::new(
            self.store().backend().clone(),
            self.mode().clone(),
            self.config().intervals.mode_probe,
        )
    }

    pub fn control_service(&self) -> ControlService {
        let config = self.config();
        ControlService::new(
            self.store().clone(),
            self.reconcile_handle(),
            self.discovery().clone(),
            self.metrics().clone(),
            config.intervals.heartbeat,
            config.policy.clone(),
        )
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            mode: self.mode().clone(),
            metrics: self.metrics().clone(),
        }
    }
}
