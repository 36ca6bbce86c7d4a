//! Call Service
//!
//! Headless call registry daemon for one user.
//!
//! A daemon has no capture devices and no negotiation library, so it runs
//! the registry side only: it watches the Redis call registry for calls
//! addressed to the configured user, logs and counts them, and serves health
//! and metrics. Calls placed or answered through it fail with a media error
//! before any record is written.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the Redis call store
//! 4. Build the `CallController` and start the incoming-call watcher
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Wait for shutdown signal, then end every session

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use call_service::actors::{CallController, CallEvents, ControllerSettings};
use call_service::config::Config;
use call_service::errors::{CallError, MediaError};
use call_service::media::{LocalMedia, MediaAcquirer, MediaConstraints};
use call_service::observability::{health_router, init_metrics_recorder, HealthState};
use call_service::peer::{PeerBackend, PeerConfig, PeerEventSink, PeerLink};
use call_service::store::RedisCallStore;
use common::MediaKind;
use secrecy::ExposeSecret;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long sessions get to publish their final status on shutdown.
const SESSION_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Capture devices of a daemon: there are none.
struct NoCaptureDevices;

#[async_trait]
impl MediaAcquirer for NoCaptureDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let kind = if constraints.video {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        Err(MediaError::DeviceUnavailable(kind))
    }
}

/// Negotiation library of a daemon: there is none.
struct NoNegotiation;

impl PeerBackend for NoNegotiation {
    fn open(
        &self,
        _config: PeerConfig,
        _events: PeerEventSink,
    ) -> Result<Box<dyn PeerLink>, CallError> {
        Err(CallError::Negotiation(
            "no negotiation library in headless mode".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Call Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        service_id = %config.service_id,
        local_user_id = %config.local_user_id,
        ring_timeout_seconds = config.ring_timeout_seconds,
        health_bind_address = %config.health_bind_address,
        ice_servers = config.ice_servers.len(),
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    info!("Connecting to Redis...");
    let store = RedisCallStore::connect(config.redis_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;
    info!("Redis connection established");

    let events = CallEvents::new();
    let controller = CallController::new(
        config.local_user_id.clone(),
        Arc::new(store),
        Arc::new(NoCaptureDevices),
        Arc::new(NoNegotiation),
        events,
        ControllerSettings::from_config(&config),
    );

    let watcher = controller
        .watch_incoming(|record| {
            info!(
                target: "call.watcher",
                call_id = %record.call_id,
                caller_id = %record.caller_id,
                media_kind = %record.media_kind,
                "Incoming call"
            );
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start incoming call watcher");
            e
        })?;

    // Readiness follows the registry feed behind the watcher
    health_state.set_registry_watch(true);
    let watch_health = Arc::clone(&health_state);
    let watch_stopped = watcher.stopped();
    tokio::spawn(async move {
        watch_stopped.await;
        watch_health.set_registry_watch(false);
        warn!("Incoming call watcher stopped, reporting not ready");
    });

    let shutdown_token = controller.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    // Add /metrics endpoint served by Prometheus exporter
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    health_state.set_ready();
    info!("Call Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    watcher.stop();
    controller.shutdown(SESSION_SHUTDOWN_DEADLINE).await;

    info!("Call Service shutdown complete");
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
