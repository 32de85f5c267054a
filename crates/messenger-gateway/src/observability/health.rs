//! Health endpoints for the gateway.
//!
//! Kubernetes-compatible probes on the ops port:
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (can we accept connections?)
//! - `GET /status` - Room counts for debugging and dashboards
//!
//! The `/metrics` endpoint is served separately via
//! `metrics-exporter-prometheus`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::actors::registry::RegistryHandle;

/// Liveness/readiness state shared with the shutdown path.
#[derive(Debug)]
pub struct HealthState {
    /// True after startup initialization.
    live: AtomicBool,
    /// True once the gateway accepts WebSocket connections; cleared
    /// when draining begins.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct OpsState {
    health: Arc<HealthState>,
    registry: RegistryHandle,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    dialog_rooms: usize,
    conference_rooms: usize,
    draining: bool,
}

/// Build the ops router with liveness, readiness, and status endpoints.
pub fn health_router(health: Arc<HealthState>, registry: RegistryHandle) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .with_state(OpsState { health, registry })
}

async fn liveness_handler(State(state): State<OpsState>) -> StatusCode {
    if state.health.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<OpsState>) -> StatusCode {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(
    State(state): State<OpsState>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let status = state
        .registry
        .status()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(StatusResponse {
        status: if status.draining { "draining" } else { "ok" },
        dialog_rooms: status.dialog_rooms,
        conference_rooms: status.conference_rooms,
        draining: status.draining,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_ready_toggles() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(!state.is_ready());
    }
}
