//! Room Controller
//!
//! Multi-party media session orchestration: clients create and join rooms,
//! publish one stream each and subscribe to the streams of others over a
//! WebSocket signaling channel. Media is forwarded by the media engine.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3000, path `/ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start the media engine and its worker pool
//! 4. Initialize actor system (`RoomRegistryHandle`) and the dispatcher
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start signaling server
//! 7. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use room_controller::actors::{ActorMetrics, RoomRegistryHandle};
use room_controller::config::Config;
use room_controller::media::types::default_media_codecs;
use room_controller::media::{EngineCall, InMemoryEngine, MediaEngine, WorkerPool};
use room_controller::observability::metrics::init_metrics_recorder;
use room_controller::observability::{health_router, HealthState};
use room_controller::signaling::{signaling_router, SignalingDispatcher};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Room Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        rc_id = %config.rc_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        worker_count = config.worker_count,
        max_peers_per_room = config.max_peers_per_room,
        engine_timeout_ms = u64::try_from(config.engine_timeout.as_millis()).unwrap_or(u64::MAX),
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Media engine: the in-process engine runs signaling-only (no packets)
    let engine: Arc<dyn MediaEngine> = Arc::new(InMemoryEngine::new());
    let pool = Arc::new(
        WorkerPool::start(Arc::clone(&engine), config.worker_count)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to start media workers");
                e
            })?,
    );
    for worker_id in pool.worker_ids().await {
        info!(worker_id = %worker_id, "Media worker started");
    }
    let engine_call = EngineCall::new(Arc::clone(&engine), config.engine_timeout);

    // Initialize actor system
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        config.rc_id.clone(),
        Arc::clone(&pool),
        engine_call.clone(),
        config.max_peers_per_room,
        Arc::clone(&actor_metrics),
    );
    let dispatcher = SignalingDispatcher::start(
        registry.clone(),
        engine_call,
        Arc::clone(&pool),
        config.transport_options(),
        default_media_codecs(),
        actor_metrics,
    );
    info!("Actor system initialized");

    let shutdown_token = CancellationToken::new();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app =
        signaling_router(Arc::clone(&dispatcher)).layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_task = tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Room Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Refuse new rooms, then drop every peer (their sockets close as sessions end)
    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Room registry shutdown error");
    }
    dispatcher.shutdown().await;
    pool.close_all().await;

    shutdown_token.cancel();
    for (name, task) in [("signaling", signaling_task), ("health", health_task)] {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!(server = name, "Server did not stop in time");
        }
    }
    registry.cancel();

    info!("Room Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
