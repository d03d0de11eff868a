//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::relay::{LinkCounter, SessionOptions, SessionRegistry};

/// Shared application state for the relay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live sessions keyed by master key.
    pub registry: SessionRegistry,
    /// Process-wide count of upgraded sockets, bounded by `relay.links_limit`.
    pub links: LinkCounter,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new(SessionOptions::from_config(&config));
        let links = LinkCounter::new(config.relay.links_limit);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            links,
        }
    }
}
