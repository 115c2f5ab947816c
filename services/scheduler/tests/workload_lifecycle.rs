//! Placement, stop, delete and retry exhaustion driven through the control
//! service.

mod common;

use std::time::Duration;

use common::{Harness, N1_ENDPOINT};
use persys_events::EventType;
use persys_proto::scheduler::v1::{self as proto, SchedulerControl};
use persys_scheduler::agent::{AgentCall, AgentError};
use persys_scheduler::model::{DesiredState, WorkloadStatus};
use persys_scheduler::scheduler::ReconcileAction;
use persys_scheduler::store::{keys, KvBackend};
use tonic::Request;

#[tokio::test]
async fn test_happy_path_placement() {
    let harness = Harness::start().await;
    let registered = harness.register("N1", N1_ENDPOINT, &["container"]).await;
    assert!(registered.accepted);
    assert_eq!(registered.heartbeat_interval_seconds, 60);

    let response = harness
        .apply(Harness::container_request("W1", "alpine:latest", "Running"))
        .await
        .unwrap();
    assert!(response.success, "{}", response.message);
    assert_eq!(response.status, "Running");

    let workload = harness.workload("W1").await.unwrap();
    assert_eq!(workload.node_id.as_deref(), Some("N1"));
    assert_eq!(workload.status, WorkloadStatus::Running);

    let store = harness.state.store();
    let assignment = store.get_assignment("W1").await.unwrap().unwrap();
    assert_eq!(assignment.node_id, "N1");
    let record = store.get_reconciliation("W1").await.unwrap().unwrap();
    assert_eq!(record.action, ReconcileAction::ReapplyRunning.as_str());
    assert!(record.success);
    assert_eq!(harness.agent.apply_count("W1"), 1);

    // applying the same spec again converges without a second launch
    let again = harness
        .apply(Harness::container_request("W1", "alpine:latest", "Running"))
        .await
        .unwrap();
    assert!(again.success);
    assert_eq!(harness.agent.apply_count("W1"), 1);
    assert_eq!(harness.agent.hosted(N1_ENDPOINT).len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_stop_then_delete_purges_records() {
    let harness = Harness::start().await;
    harness.register("N1", N1_ENDPOINT, &["container"]).await;
    harness
        .apply(Harness::container_request("W1", "alpine:latest", "Running"))
        .await
        .unwrap();

    let stopped = harness
        .apply(Harness::container_request("W1", "alpine:latest", "Stopped"))
        .await
        .unwrap();
    assert!(stopped.success, "{}", stopped.message);
    assert_eq!(stopped.status, "Stopped");
    assert!(harness.agent.calls().iter().any(|call| matches!(
        call,
        AgentCall::Apply { workload_id, desired: DesiredState::Stopped, .. } if workload_id == "W1"
    )));

    let deleted = harness
        .service
        .delete_workload(Request::new(proto::DeleteWorkloadRequest {
            workload_id: "W1".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(deleted.accepted);

    let store = harness.state.store().clone();
    assert!(
        harness
            .eventually(|| {
                let store = store.clone();
                async move { store.get_raw(&keys::workload("W1")).await.unwrap().is_none() }
            })
            .await
    );
    assert_eq!(harness.agent.delete_count("W1"), 1);
    for key in [
        keys::workload("W1"),
        keys::assignment("W1"),
        keys::reconciliation("W1"),
        keys::retry("W1"),
    ] {
        assert!(harness.backend.get(&key).await.unwrap().is_none(), "{key} survived");
    }

    // deleting again is a no-op
    let repeat = harness
        .service
        .delete_workload(Request::new(proto::DeleteWorkloadRequest {
            workload_id: "W1".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(repeat.accepted);
    assert_eq!(harness.agent.delete_count("W1"), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_retry_exhaustion_parks_until_retry_rpc() {
    let harness = Harness::start().await;
    harness.register("N1", N1_ENDPOINT, &["container"]).await;
    harness.agent.fail_applies(
        "W2",
        AgentError::Runtime {
            category: "image_pull".to_string(),
            message: "pull access denied for registry.invalid/missing".to_string(),
        },
    );

    let response = harness
        .apply(Harness::container_request("W2", "registry.invalid/missing:1", "Running"))
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.failure_reason, "RUNTIME_ERROR");

    let reconciler = harness.state.reconciler();
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        reconciler.reconcile_by_id("W2").await.unwrap();
    }

    let workload = harness.workload("W2").await.unwrap();
    assert_eq!(workload.retry.attempts, 5);
    assert_eq!(workload.status, WorkloadStatus::Failed);
    assert!(workload
        .status_info
        .failure_reason
        .as_deref()
        .is_some_and(|r| !r.is_empty()));
    let events = harness.state.store().list_events().await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::WorkloadFailed && e.workload_id.as_deref() == Some("W2")));
    assert_eq!(harness.agent.apply_count("W2"), 5);

    // parked: further passes do not touch the agent
    tokio::time::sleep(Duration::from_millis(20)).await;
    let parked = reconciler.reconcile_by_id("W2").await.unwrap().unwrap();
    assert_eq!(parked.action, ReconcileAction::NoAction);
    assert_eq!(harness.agent.apply_count("W2"), 5);

    let retry = harness
        .service
        .retry_workload(Request::new(proto::RetryWorkloadRequest {
            workload_id: "W2".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(retry.accepted);
    let agent = harness.agent.clone();
    assert!(
        harness
            .eventually(|| {
                let agent = agent.clone();
                async move { agent.apply_count("W2") == 6 }
            })
            .await
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let harness = Harness::start().await;

    let bad_endpoint = harness
        .service
        .register_node(Request::new(proto::RegisterNodeRequest {
            node_id: "N1".to_string(),
            grpc_endpoint: "no-port".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(bad_endpoint.code(), tonic::Code::InvalidArgument);

    let mut request = Harness::container_request("W9", "alpine", "Running");
    request.r#type = "lambda".to_string();
    let bad_type = harness.apply(request).await.unwrap_err();
    assert_eq!(bad_type.code(), tonic::Code::InvalidArgument);

    let unknown = harness
        .service
        .heartbeat(Request::new(proto::HeartbeatRequest {
            node_id: "ghost".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(unknown.code(), tonic::Code::NotFound);

    let missing = harness
        .service
        .get_workload(Request::new(proto::GetWorkloadRequest {
            workload_id: "missing".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(missing.code(), tonic::Code::NotFound);

    harness.stop().await;
}

#[tokio::test]
async fn test_heartbeat_folds_reports() {
    let harness = Harness::start().await;
    harness.register("N1", N1_ENDPOINT, &["container"]).await;
    harness
        .apply(Harness::container_request("W1", "alpine:latest", "Running"))
        .await
        .unwrap();

    let response = harness
        .service
        .heartbeat(Request::new(proto::HeartbeatRequest {
            node_id: "N1".to_string(),
            cpu_used_millicores: 1000,
            memory_used_mb: 2048,
            workloads: vec![proto::WorkloadReport {
                workload_id: "W1".to_string(),
                actual_state: "FAILED".to_string(),
                message: "exited with code 1".to_string(),
                ..Default::default()
            }],
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(response.acknowledged);
    assert!(response.lease_expires_at_unix > chrono::Utc::now().timestamp());

    let node = harness.node("N1").await;
    assert_eq!(node.available_cpu_millicores, 3000);
    assert_eq!(node.available_memory_mb, 6144);

    let workload = harness.workload("W1").await.unwrap();
    assert_eq!(workload.status, WorkloadStatus::Failed);
    assert_eq!(workload.logs.last().map(String::as_str), Some("exited with code 1"));

    let summary = harness
        .service
        .get_cluster_summary(Request::new(proto::GetClusterSummaryRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(summary.total_nodes, 1);
    assert_eq!(summary.ready_nodes, 1);
    assert_eq!(summary.workloads_by_status["Failed"], 1);

    harness.stop().await;
}
