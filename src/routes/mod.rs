//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to an endpoint group. [`router`] wires them
//! together with the tracing, CORS, and handshake-timeout layers.

pub mod health;
pub mod playback;
pub mod sessions;
pub mod ws;

use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    routing::get,
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::RelayConfig;
use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let relay = &state.config.relay;

    let ws_route = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            relay.handshake_timeout(),
        ));

    let playback_route = Router::new()
        .route("/file", get(playback::playback))
        .layer(cors_layer(relay));

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/{key}", get(sessions::get_session))
        .merge(ws_route)
        .merge(playback_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the playback endpoint, driven by the same allow-list as the
/// upgrade origin check.
fn cors_layer(relay: &RelayConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD])
        .allow_headers([header::RANGE])
        .expose_headers([
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
            header::CONTENT_LENGTH,
        ]);

    if relay.allow_origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = relay
        .allow_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparsable origin in allow-list");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(origins))
}
