//! Generates tonic client/server stubs for the hand-written prost messages.
//!
//! The messages live in `src/agent/v1.rs` and `src/scheduler/v1.rs`; only the
//! service plumbing is generated, so no `protoc` is needed at build time.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

struct Rpc {
    name: &'static str,
    route: &'static str,
    input: &'static str,
    output: &'static str,
    streaming: bool,
}

const fn unary(
    name: &'static str,
    route: &'static str,
    input: &'static str,
    output: &'static str,
) -> Rpc {
    Rpc {
        name,
        route,
        input,
        output,
        streaming: false,
    }
}

fn service(name: &str, package: &str, module: &str, rpcs: &[Rpc]) -> Service {
    let mut builder = Service::builder().name(name).package(package);
    for rpc in rpcs {
        let mut method = Method::builder()
            .name(rpc.name)
            .route_name(rpc.route)
            .input_type(format!("crate::{module}::{}", rpc.input))
            .output_type(format!("crate::{module}::{}", rpc.output))
            .codec_path(CODEC);
        if rpc.streaming {
            method = method.client_streaming().server_streaming();
        }
        builder = builder.method(method.build());
    }
    builder.build()
}

fn main() {
    let agent = service(
        "AgentService",
        "persys.agent.v1",
        "agent::v1",
        &[
            unary(
                "apply_workload",
                "ApplyWorkload",
                "ApplyWorkloadRequest",
                "ApplyWorkloadResponse",
            ),
            unary(
                "get_workload_status",
                "GetWorkloadStatus",
                "GetWorkloadStatusRequest",
                "GetWorkloadStatusResponse",
            ),
            unary(
                "delete_workload",
                "DeleteWorkload",
                "DeleteWorkloadRequest",
                "DeleteWorkloadResponse",
            ),
            unary(
                "list_workloads",
                "ListWorkloads",
                "ListWorkloadsRequest",
                "ListWorkloadsResponse",
            ),
            unary(
                "list_actions",
                "ListActions",
                "ListActionsRequest",
                "ListActionsResponse",
            ),
        ],
    );

    let scheduler = service(
        "SchedulerControl",
        "persys.scheduler.v1",
        "scheduler::v1",
        &[
            unary(
                "register_node",
                "RegisterNode",
                "RegisterNodeRequest",
                "RegisterNodeResponse",
            ),
            unary(
                "heartbeat",
                "Heartbeat",
                "HeartbeatRequest",
                "HeartbeatResponse",
            ),
            unary(
                "delete_node",
                "DeleteNode",
                "DeleteNodeRequest",
                "DeleteNodeResponse",
            ),
            unary(
                "apply_workload",
                "ApplyWorkload",
                "ApplyWorkloadRequest",
                "ApplyWorkloadResponse",
            ),
            unary(
                "delete_workload",
                "DeleteWorkload",
                "DeleteWorkloadRequest",
                "DeleteWorkloadResponse",
            ),
            unary(
                "retry_workload",
                "RetryWorkload",
                "RetryWorkloadRequest",
                "RetryWorkloadResponse",
            ),
            unary(
                "list_nodes",
                "ListNodes",
                "ListNodesRequest",
                "ListNodesResponse",
            ),
            unary("get_node", "GetNode", "GetNodeRequest", "GetNodeResponse"),
            unary(
                "list_workloads",
                "ListWorkloads",
                "ListWorkloadsRequest",
                "ListWorkloadsResponse",
            ),
            unary(
                "get_workload",
                "GetWorkload",
                "GetWorkloadRequest",
                "GetWorkloadResponse",
            ),
            unary(
                "get_cluster_summary",
                "GetClusterSummary",
                "GetClusterSummaryRequest",
                "GetClusterSummaryResponse",
            ),
            Rpc {
                name: "control_stream",
                route: "ControlStream",
                input: "ControlMessage",
                output: "ControlMessage",
                streaming: true,
            },
        ],
    );

    Builder::new().compile(&[agent, scheduler]);

    println!("cargo:rerun-if-changed=build.rs");
}
