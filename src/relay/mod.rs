//! Relay engine: connections, sessions, and the registry that binds them.
//!
//! ```text
//!  master ──ws──► Connection ──on_data──► Session::broadcast ──┬──► Recorder (file)
//!                                                             ├──► slave Connection ──ws──► client
//!                                                             └──► slave Connection ──ws──► client
//! ```
//!
//! - [`connection`]: one socket's read/write/dispatch tasks and heartbeat
//! - [`session`]: one master, its slaves, and its recording
//! - [`registry`]: key → session routing for upgraded sockets
//! - [`links`]: process-wide link counter
//! - [`classify`]: closed vs. transient transport errors

pub mod classify;
pub mod connection;
pub mod links;
pub mod registry;
pub mod session;

pub use connection::{Connection, ConnectionHandler, ConnectionOptions, Transport};
pub use links::{LinkCounter, LinkPermit};
pub use registry::{Role, SessionRegistry};
pub use session::{Session, SessionInfo, SessionOptions};
