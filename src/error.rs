//! Error taxonomy for the relay.
//!
//! Connection-level failures (`ConnectionClosed`, `HeartbeatTimeout`,
//! `TransientIo`, `UnexpectedFault`) are handled inside the connection tasks:
//! they are logged, absorbed, or turned into a close. Only routing and
//! capacity failures reach the HTTP caller, via the [`IntoResponse`] impl
//! below.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Every failure the relay can report.
///
/// `Clone` so that one terminal error can be handed to each `close()` caller
/// and to the disconnect handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The transport reported a condition that makes the socket unusable.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// No pong (or any other frame) arrived within the missed-pong window.
    #[error("ping timeout")]
    HeartbeatTimeout,
    /// A read or write failed in a way that does not end the connection.
    #[error("transient i/o error: {0}")]
    TransientIo(String),
    /// Missing, empty, or malformed `master`/`slave` parameters.
    #[error("invalid role: {0}")]
    InvalidRole(String),
    /// A slave tried to join a session key that has no live master.
    #[error("unknown session: {0}")]
    UnknownSession(String),
    /// The process-wide link counter is at its configured limit.
    #[error("link limit of {limit} exceeded")]
    LinkLimitExceeded { limit: usize },
    /// A connection task panicked.
    #[error("unexpected fault: {0}")]
    UnexpectedFault(String),
    /// The request's `Origin` header is not in the allow-list.
    #[error("origin not allowed: {0}")]
    OriginRejected(String),
    /// The recording file could not be opened or written.
    #[error("recording error: {0}")]
    Recording(String),
    /// A slave with the same identity is already attached to the session.
    #[error("duplicate slave: {0}")]
    DuplicateSlave(String),
    /// The outbound queue of a connection is full.
    #[error("outbound queue full")]
    QueueFull,
}

impl RelayError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionClosed(_) => "CONNECTION_CLOSED",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::TransientIo(_) => "TRANSIENT_IO",
            Self::InvalidRole(_) => "INVALID_ROLE",
            Self::UnknownSession(_) => "UNKNOWN_SESSION",
            Self::LinkLimitExceeded { .. } => "LINK_LIMIT_EXCEEDED",
            Self::UnexpectedFault(_) => "UNEXPECTED_FAULT",
            Self::OriginRejected(_) => "ORIGIN_REJECTED",
            Self::Recording(_) => "RECORDING_ERROR",
            Self::DuplicateSlave(_) => "DUPLICATE_SLAVE",
            Self::QueueFull => "QUEUE_FULL",
        }
    }

    /// HTTP status the error maps to when surfaced on the upgrade path.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRole(_) => StatusCode::BAD_REQUEST,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::OriginRejected(_) => StatusCode::FORBIDDEN,
            Self::LinkLimitExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DuplicateSlave(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error ends the connection it occurred on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed(_) | Self::HeartbeatTimeout | Self::UnexpectedFault(_)
        )
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}
