//! Gateway - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{routing::get, Json, Router};
use gateway_common::logging::{init_logging, LogConfig};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::Layer;
use tracing::{info, warn};

use gateway_server::{
    audit::AuditPipeline,
    config::Config,
    metrics::{self, AuditlogMetrics, MetricsRegistry},
    middleware,
    proxy::{self, HttpForwarder, ReverseProxy},
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("gateway")
        .filter_directives("gateway_server=debug,tower_http=debug")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    info!("Starting gateway");

    let config = Config::load()?;
    info!(address = %config.server.address, "Configuration loaded");

    let registry = Arc::new(MetricsRegistry::new()?);
    let audit_metrics = AuditlogMetrics::new(&registry.meter());

    let shutdown = CancellationToken::new();
    let pipeline =
        AuditPipeline::from_config(config.auditlog.as_ref(), shutdown.clone(), audit_metrics)?;

    let forwarder = HttpForwarder::new(reqwest::Client::new());
    let transport = pipeline
        .layer
        .clone()
        .with_forward_timeout(config.server.handler_timeout())
        .layer(forwarder);

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(proxy::router(ReverseProxy::new(
            "/director",
            &config.server.director_origin,
            transport.clone(),
        )))
        .merge(proxy::router(ReverseProxy::new(
            "/connector",
            &config.server.connector_origin,
            transport.clone(),
        )))
        .merge(proxy::router(ReverseProxy::new(
            "/nsadapter",
            &config.server.nsadapter_origin,
            transport,
        )))
        .layer(middleware::tracing_layer());

    for (prefix, origin) in [
        ("/director", &config.server.director_origin),
        ("/connector", &config.server.connector_origin),
        ("/nsadapter", &config.server.nsadapter_origin),
    ] {
        info!(prefix, origin = %origin, "Proxying requests");
    }

    let metrics_addr: SocketAddr = config.server.metrics_address.parse()?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!("Metrics listening on {}", metrics_addr);
    let metrics_shutdown = shutdown.clone();
    let metrics_server = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics::router(registry))
            .with_graceful_shutdown(metrics_shutdown.cancelled_owned())
            .await
    });

    let addr: SocketAddr = config.server.address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the post-log worker and the metrics server; queued records are dropped
    shutdown.cancel();
    match metrics_server.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => warn!(error = %e, "Metrics server failed"),
        Err(e) => warn!(error = %e, "Metrics server panicked"),
    }
    if let Some(worker) = pipeline.worker {
        let grace = config.server.shutdown_timeout();
        match tokio::time::timeout(grace, worker).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!(error = %e, "Audit log worker panicked"),
            Err(_) => warn!("Audit log worker did not stop within {:?}", grace),
        }
    }

    info!("Gateway shut down gracefully");

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
