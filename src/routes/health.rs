//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, live session count, and link usage.
/// Suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.registry.len().await;
    let recording = &state.config.recording;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "links": {
            "current": state.links.current(),
            "limit": state.links.limit(),
        },
        "recording": {
            "enabled": recording.enabled,
            "dir": recording.dir,
            "container": recording.container,
        },
    }))
}
