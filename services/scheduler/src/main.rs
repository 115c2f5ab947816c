//! persys scheduler
//!
//! Accepts node registrations and workload intents over gRPC, places
//! workloads on nodes and drives node agents until the cluster matches the
//! stored intent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use persys_proto::scheduler::v1::SchedulerControlServer;
use persys_scheduler::{
    agent::GrpcAgentTransport,
    api,
    config::{Config, TlsConfig},
    metrics::SchedulerMetrics,
    state::SchedulerState,
    store::EtcdBackend,
    telemetry,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    telemetry::init(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting persys scheduler");
    info!(
        grpc_addr = %config.grpc_addr(),
        metrics_addr = %config.metrics_addr(),
        store = ?config.store.endpoints,
        tls = config.tls.enabled,
        "Configuration loaded"
    );
    if let Some(endpoint) = &config.otlp_endpoint {
        info!(endpoint = %endpoint, "Trace export endpoint configured");
    }

    let backend = match EtcdBackend::connect(&config.store).await {
        Ok(backend) => {
            info!("State store connection established");
            backend
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to state store");
            return Err(e.into());
        }
    };

    let metrics = Arc::new(SchedulerMetrics::new().context("failed to register metrics")?);
    let agent = GrpcAgentTransport::from_config(&config.agent, &config.tls, metrics.clone())?;
    let server_tls = if config.tls.enabled {
        Some(load_server_tls(&config.tls).await?)
    } else {
        None
    };

    let (state, requests) = SchedulerState::new(
        config.clone(),
        Arc::new(backend),
        Arc::new(agent),
        metrics,
    );

    if let Err(e) = state.discovery().publish_self().await {
        warn!(error = %e, "Failed to publish scheduler discovery records");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let mode_supervisor = state.mode_supervisor();
    workers.push((
        "mode supervisor",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { mode_supervisor.run(shutdown_rx).await }
        }),
    ));

    let reconciler = state.reconciler_worker(requests);
    workers.push((
        "reconciler",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { reconciler.run(shutdown_rx).await }
        }),
    ));

    let monitor = state.monitor();
    workers.push((
        "monitor",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { monitor.run(shutdown_rx).await }
        }),
    ));

    let drift = state.drift_detector();
    workers.push((
        "drift detector",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { drift.run(shutdown_rx).await }
        }),
    ));

    let node_health = state.node_health();
    workers.push((
        "node health monitor",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { node_health.run(shutdown_rx).await }
        }),
    ));

    // Control-plane gRPC server
    let grpc_addr = config.grpc_addr();
    let mut builder = Server::builder();
    if let Some(tls) = server_tls {
        builder = builder.tls_config(tls).context("invalid server TLS configuration")?;
    }
    let router = builder.add_service(SchedulerControlServer::new(state.control_service()));
    let mut grpc_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            info!(addr = %grpc_addr, "Serving control-plane gRPC");
            router
                .serve_with_shutdown(grpc_addr, wait_for_shutdown(shutdown_rx, "gRPC server"))
                .await
                .context("gRPC server failed")
        }
    });

    // Metrics and health HTTP server
    let app = api::create_router(state.api_state());
    let listener = tokio::net::TcpListener::bind(config.metrics_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.metrics_addr()))?;
    info!(addr = %config.metrics_addr(), "Serving metrics and health");
    let mut http_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(wait_for_shutdown(shutdown_rx, "HTTP server"))
                .await
                .context("HTTP server failed")
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut grpc_handle => {
            report_exit("gRPC server", result);
        }
        result = &mut http_handle => {
            report_exit("HTTP server", result);
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    for (name, handle) in workers {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
            warn!(worker = name, "Worker did not shut down in time");
        }
    }
    for (name, handle) in [("gRPC server", grpc_handle), ("HTTP server", http_handle)] {
        if !handle.is_finished() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(result) => report_exit(name, result),
                Err(_) => warn!(server = name, "Server did not shut down in time"),
            }
        }
    }

    if let Err(e) = state.discovery().withdraw_self().await {
        warn!(error = %e, "Failed to withdraw scheduler discovery records");
    }

    info!("Scheduler shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>, name: &'static str) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    info!(server = name, "Shutting down");
}

fn report_exit(name: &str, result: Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!(server = name, "Server exited"),
        Ok(Err(e)) => error!(server = name, error = %e, "Server error"),
        Err(e) => error!(server = name, error = %e, "Server task panicked"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Server identity plus, when a CA is configured, client verification.
async fn load_server_tls(tls: &TlsConfig) -> Result<ServerTlsConfig> {
    let cert_path = tls.cert_path.as_ref().context("TLS enabled but TLS_CERT_PATH is unset")?;
    let key_path = tls.key_path.as_ref().context("TLS enabled but TLS_KEY_PATH is unset")?;
    let cert = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("failed to read {}", cert_path.display()))?;
    let key = tokio::fs::read(key_path)
        .await
        .with_context(|| format!("failed to read {}", key_path.display()))?;

    let mut server_tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
    if let Some(ca_path) = &tls.ca_path {
        let ca = tokio::fs::read(ca_path)
            .await
            .with_context(|| format!("failed to read {}", ca_path.display()))?;
        server_tls = server_tls.client_ca_root(Certificate::from_pem(ca));
    }
    Ok(server_tls)
}
