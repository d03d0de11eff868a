//! WebSocket upgrade endpoint for masters and slaves.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::relay::registry::resolve_role;
use crate::relay::{Role, Transport};
use crate::state::AppState;

/// Query parameters for `GET /ws`.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub master: String,
    #[serde(default)]
    pub slave: String,
}

/// `GET /ws?master=<key>&slave=<key>`: upgrade to a relay socket.
///
/// `master == slave` opens a new session under that key. Any other `slave`
/// joins the session named by `master`. Before upgrading, the request must
/// pass the origin allow-list, carry valid keys, name a live session (slaves
/// only), and find room under the link limit.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let relay = &state.config.relay;

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !relay.origin_allowed(origin) {
        warn!(%remote, origin = ?origin, "origin rejected");
        return RelayError::OriginRejected(origin.unwrap_or("<none>").to_string()).into_response();
    }

    let role = match resolve_role(&query.master, &query.slave) {
        Ok(role) => role,
        Err(e) => return e.into_response(),
    };
    if role == Role::Slave && !state.registry.contains(&query.master).await {
        debug!(%remote, session = %query.master, "slave for unknown session");
        return RelayError::UnknownSession(query.master).into_response();
    }

    let permit = match state.links.acquire() {
        Ok(p) => p,
        Err(e) => {
            warn!(%remote, current = state.links.current(), "link limit reached");
            return e.into_response();
        }
    };

    ws.read_buffer_size(relay.read_buffer_size)
        .write_buffer_size(relay.write_buffer_size)
        .max_message_size(relay.read_limit)
        .on_failed_upgrade(move |e| warn!(%remote, "websocket upgrade failed: {e}"))
        .on_upgrade(move |socket| async move {
            let transport = Transport::from_socket(socket, remote);
            match state
                .registry
                .handle_upgrade(transport, &query.master, &query.slave, Some(permit))
                .await
            {
                Ok(role) => debug!(%remote, session = %query.master, ?role, "socket routed"),
                Err(e) => warn!(%remote, session = %query.master, error = %e, "socket rejected after upgrade"),
            }
        })
}
