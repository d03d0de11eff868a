//! Read-only view of live sessions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::error::RelayError;
use crate::state::AppState;

/// `GET /api/sessions`: every live session, sorted by key.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.registry.list().await;
    Json(json!({ "sessions": sessions }))
}

/// `GET /api/sessions/{key}`: one session, or 404 `UNKNOWN_SESSION`.
pub async fn get_session(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.registry.get(&key).await {
        Some(session) => (StatusCode::OK, Json(session.info().await)).into_response(),
        None => RelayError::UnknownSession(key).into_response(),
    }
}
