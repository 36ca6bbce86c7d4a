//! Health endpoints for the call service.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe
//!
//! Readiness requires both:
//!
//! - the service has finished startup and is not shutting down
//! - the incoming-call watcher still has a live registry feed
//!
//! `/ready` answers 503 with the first unmet condition as the body.
//!
//! The `/metrics` endpoint is merged in by `main.rs` from the Prometheus
//! exporter handle.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness conditions.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    accepting: AtomicBool,
    registry_watch: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not accepting, no registry watch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            accepting: AtomicBool::new(false),
            registry_watch: AtomicBool::new(false),
        }
    }

    /// Startup finished.
    pub fn set_ready(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Shutdown began.
    pub fn set_not_ready(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Record whether the incoming-call watcher has a live registry feed.
    pub fn set_registry_watch(&self, up: bool) {
        self.registry_watch.store(up, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.unmet_condition().is_none()
    }

    fn unmet_condition(&self) -> Option<&'static str> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Some("not accepting calls");
        }
        if !self.registry_watch.load(Ordering::SeqCst) {
            return Some("registry watch down");
        }
        None
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    match state.unmet_condition() {
        None => (StatusCode::OK, "ready"),
        Some(condition) => (StatusCode::SERVICE_UNAVAILABLE, condition),
    }
}
