#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! # mediarelay
//!
//! Real-time WebSocket media relay with recording and range playback.
//!
//! A master connection publishes an opaque binary stream under a session
//! key. Any number of slave connections attached to that key receive the
//! stream as it arrives, and the stream is appended to a per-session file
//! that can be played back later over HTTP with byte ranges.
//!
//! ## API surface
//!
//! | Method | Path                      | Description                                  |
//! |--------|---------------------------|----------------------------------------------|
//! | GET    | `/ws?master=K&slave=K`    | Upgrade as master of session `K`             |
//! | GET    | `/ws?master=K&slave=S`    | Upgrade as slave of session `K`              |
//! | GET    | `/file?master=K`          | Recording for `K` (supports `Range`)         |
//! | GET    | `/api/health`             | Liveness probe with link and session counts  |
//! | GET    | `/api/sessions`           | Live sessions                                |
//! | GET    | `/api/sessions/{key}`     | One live session                             |
//!
//! ## Architecture
//!
//! ```text
//! main.rs              entry point, clap subcommands, graceful shutdown
//! config.rs            TOML + env-var configuration
//! error.rs             RelayError taxonomy and HTTP mapping
//! state.rs             AppState shared by handlers
//! recording.rs         append-only per-session recording writer
//! relay/
//!   connection.rs      read/write/dispatch tasks, heartbeat, idempotent close
//!   session.rs         master + slaves fan-out, recording, teardown
//!   registry.rs        key → session routing for upgraded sockets
//!   links.rs           process-wide link counter
//!   classify.rs        closed vs. transient transport errors
//! routes/
//!   ws.rs              GET /ws
//!   playback.rs        GET /file
//!   health.rs          GET /api/health
//!   sessions.rs        GET /api/sessions
//! ```

pub mod config;
pub mod error;
pub mod recording;
pub mod relay;
pub mod routes;
pub mod state;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::RelayError;
pub use relay::{Connection, ConnectionHandler, Session, SessionRegistry};
pub use state::AppState;
