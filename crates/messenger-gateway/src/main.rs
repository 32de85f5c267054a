//! Messenger Gateway
//!
//! Stateful WebSocket server for real-time dialog messaging and video
//! conference signaling.
//!
//! # Servers
//!
//! The gateway runs two HTTP servers:
//! - WebSocket server for client traffic (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Initialize the message store, presence table, and media plane
//! 4. Spawn the `RegistryActor`
//! 5. Start the health HTTP server (liveness, readiness, status, metrics)
//! 6. Start the WebSocket server and mark ready
//! 7. On shutdown signal: mark not ready, stop accepting, drain rooms

#![warn(clippy::pedantic)]

use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use messenger_gateway::actors::metrics::ActorMetrics;
use messenger_gateway::actors::registry::RegistryActor;
use messenger_gateway::config::GatewayConfig;
use messenger_gateway::connections::ConnectionTable;
use messenger_gateway::gateway::{self, AppState};
use messenger_gateway::media::LoopbackMediaPlane;
use messenger_gateway::observability::health::{health_router, HealthState};
use messenger_gateway::store::{InMemoryAuthority, InMemoryStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "messenger_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Messenger Gateway");

    let config = GatewayConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        typing_ttl_seconds = config.typing_ttl.as_secs(),
        persistence_timeout_ms = config.persistence_timeout.as_millis(),
        send_buffer = config.send_buffer,
        "Configuration loaded successfully"
    );

    // The recorder must be installed before any metrics are recorded.
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;

    let health_state = Arc::new(HealthState::new());

    // Backing services. An external store DSN is accepted but the
    // in-process backends are the only ones wired up so far.
    // TODO: construct a SQL-backed MessageStore when GW_STORE_DSN is set.
    if config.store_dsn_value().is_some() {
        warn!("GW_STORE_DSN is set but only the in-process store is available; using it");
    }
    let store = Arc::new(InMemoryStore::new());
    let authority = Arc::new(InMemoryAuthority::new());
    let connections = Arc::new(ConnectionTable::new());
    let media = Arc::new(LoopbackMediaPlane::new());
    let metrics = ActorMetrics::new();

    let shutdown_token = CancellationToken::new();
    let (registry, _registry_task) = RegistryActor::spawn(
        shutdown_token.child_token(),
        store,
        Arc::clone(&connections),
        config.room_config(),
        Arc::clone(&metrics),
    );
    info!("Actor system initialized");

    // Health server: probes plus the Prometheus render endpoint. Bind
    // before spawning to fail fast on bind errors.
    let health_addr = config.health_bind_address;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let ops_app = health_router(Arc::clone(&health_state), registry.clone()).merge(metrics_router);

    let ops_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let ops_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(ops_listener, ops_app).with_graceful_shutdown(async move {
            ops_shutdown.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // WebSocket gateway server.
    let app_state = AppState {
        registry: registry.clone(),
        connections,
        media,
        authority,
        metrics,
        cancel_token: shutdown_token.child_token(),
        send_buffer: config.send_buffer,
        persistence_timeout: config.persistence_timeout,
    };
    let app = gateway::router(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.bind_address, "Failed to bind gateway server");
            format!("Failed to bind gateway server to {}: {e}", config.bind_address)
        })?;
    info!(addr = %config.bind_address, "Gateway server bound successfully");

    health_state.set_ready();

    let serve_shutdown = shutdown_token.child_token();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        serve_shutdown.cancelled().await;
        info!("Gateway server shutting down");
    });

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!(error = %e, "Gateway server failed");
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, draining");

    // Stop advertising readiness before tearing anything down so load
    // balancers drain us first.
    health_state.set_not_ready();
    registry.shutdown().await;
    shutdown_token.cancel();

    if let Err(e) = server_task.await {
        warn!(error = %e, "Gateway server task ended abnormally");
    }

    info!("Messenger Gateway stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
