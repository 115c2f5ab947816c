//! Prometheus metrics for the scheduler.

use std::collections::HashMap;
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::mode::Mode;
use crate::model::{DesiredState, Node, NodeStatus, Workload, WorkloadStatus};

const NAMESPACE: &str = "scheduler";

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
const APPLY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 45.0, 120.0, 240.0];

pub struct SchedulerMetrics {
    registry: Registry,

    // Control-plane RPC
    pub grpc_requests: CounterVec,
    pub grpc_duration: HistogramVec,

    // Agent RPC
    pub agent_requests: CounterVec,
    pub agent_duration: HistogramVec,

    // Reconciliation
    pub reconciliation_results: CounterVec,
    pub reconciliation_cycles: CounterVec,
    pub cycle_duration: Histogram,

    // State gauges
    pub nodes_status: GaugeVec,
    pub workloads_status: GaugeVec,
    pub workloads_desired: GaugeVec,

    pub drift_findings: CounterVec,
    pub mode: GaugeVec,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let grpc_requests = CounterVec::new(
            Opts::new("grpc_server_requests_total", "Control-plane RPCs handled").namespace(NAMESPACE),
            &["method", "code"],
        )?;
        let grpc_duration = HistogramVec::new(
            HistogramOpts::new("grpc_server_request_duration_seconds", "Control-plane RPC latency")
                .namespace(NAMESPACE)
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["method"],
        )?;

        let agent_requests = CounterVec::new(
            Opts::new("agent_rpc_requests_total", "RPCs issued to node agents").namespace(NAMESPACE),
            &["rpc", "code"],
        )?;
        let agent_duration = HistogramVec::new(
            HistogramOpts::new("agent_rpc_duration_seconds", "Node agent RPC latency")
                .namespace(NAMESPACE)
                .buckets(APPLY_BUCKETS.to_vec()),
            &["rpc"],
        )?;

        let reconciliation_results = CounterVec::new(
            Opts::new("reconciliation_results_total", "Per-workload reconcile outcomes")
                .namespace(NAMESPACE),
            &["action", "success"],
        )?;
        let reconciliation_cycles = CounterVec::new(
            Opts::new("reconciliation_cycles_total", "Reconcile cycles run").namespace(NAMESPACE),
            &["result"],
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new("reconciliation_cycle_duration_seconds", "Reconcile cycle duration")
                .namespace(NAMESPACE)
                .buckets(APPLY_BUCKETS.to_vec()),
        )?;

        let nodes_status = GaugeVec::new(
            Opts::new("nodes_status", "Nodes by status").namespace(NAMESPACE),
            &["status"],
        )?;
        let workloads_status = GaugeVec::new(
            Opts::new("workloads_status", "Workloads by status").namespace(NAMESPACE),
            &["status"],
        )?;
        let workloads_desired = GaugeVec::new(
            Opts::new("workloads_desired_state", "Workloads by desired state").namespace(NAMESPACE),
            &["desired_state"],
        )?;

        let drift_findings = CounterVec::new(
            Opts::new("drift_findings_total", "Drift findings by type and remediation")
                .namespace(NAMESPACE),
            &["drift_type", "action"],
        )?;
        let mode = GaugeVec::new(
            Opts::new("mode", "1 for the current operational mode").namespace(NAMESPACE),
            &["mode"],
        )?;

        registry.register(Box::new(grpc_requests.clone()))?;
        registry.register(Box::new(grpc_duration.clone()))?;
        registry.register(Box::new(agent_requests.clone()))?;
        registry.register(Box::new(agent_duration.clone()))?;
        registry.register(Box::new(reconciliation_results.clone()))?;
        registry.register(Box::new(reconciliation_cycles.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(nodes_status.clone()))?;
        registry.register(Box::new(workloads_status.clone()))?;
        registry.register(Box::new(workloads_desired.clone()))?;
        registry.register(Box::new(drift_findings.clone()))?;
        registry.register(Box::new(mode.clone()))?;

        Ok(Self {
            registry,
            grpc_requests,
            grpc_duration,
            agent_requests,
            agent_duration,
            reconciliation_results,
            reconciliation_cycles,
            cycle_duration,
            nodes_status,
            workloads_status,
            workloads_desired,
            drift_findings,
            mode,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_grpc(&self, method: &str, code: &str, elapsed: Duration) {
        self.grpc_requests.with_label_values(&[method, code]).inc();
        self.grpc_duration
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_agent_rpc(&self, rpc: &str, code: &str, elapsed: Duration) {
        self.agent_requests.with_label_values(&[rpc, code]).inc();
        self.agent_duration
            .with_label_values(&[rpc])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_reconcile(&self, action: &str, success: bool) {
        self.reconciliation_results
            .with_label_values(&[action, if success { "true" } else { "false" }])
            .inc();
    }

    pub fn record_cycle(&self, result: &str, elapsed: Duration) {
        self.reconciliation_cycles.with_label_values(&[result]).inc();
        self.cycle_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_drift(&self, drift_type: &str, action: &str) {
        self.drift_findings
            .with_label_values(&[drift_type, action])
            .inc();
    }

    pub fn set_mode(&self, current: Mode) {
        for mode in Mode::ALL {
            let value = if mode == current { 1.0 } else { 0.0 };
            self.mode.with_label_values(&[mode.as_str()]).set(value);
        }
    }

    /// Recount the node and workload gauges. Every known label is written so
    /// vanished states drop to zero.
    pub fn refresh_gauges(&self, nodes: &[Node], workloads: &[Workload]) {
        let mut by_node_status: HashMap<&str, f64> = HashMap::new();
        for node in nodes {
            *by_node_status.entry(node.status.as_str()).or_default() += 1.0;
        }
        for status in [NodeStatus::Ready, NodeStatus::NotReady] {
            let count = by_node_status.get(status.as_str()).copied().unwrap_or(0.0);
            self.nodes_status.with_label_values(&[status.as_str()]).set(count);
        }

        let mut by_status: HashMap<&str, f64> = HashMap::new();
        let mut by_desired: HashMap<&str, f64> = HashMap::new();
        for workload in workloads {
            *by_status.entry(workload.status.as_str()).or_default() += 1.0;
            *by_desired.entry(workload.desired_state.as_str()).or_default() += 1.0;
        }
        for status in WorkloadStatus::ALL {
            let count = by_status.get(status.as_str()).copied().unwrap_or(0.0);
            self.workloads_status.with_label_values(&[status.as_str()]).set(count);
        }
        for desired in [DesiredState::Running, DesiredState::Stopped, DesiredState::Deleted] {
            let count = by_desired.get(desired.as_str()).copied().unwrap_or(0.0);
            self.workloads_desired
                .with_label_values(&[desired.as_str()])
                .set(count);
        }
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
