//! Configuration loading, defaults, and validation.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `MEDIARELAY_LISTEN`,
//!    `MEDIARELAY_RECORDING_DIR`, `MEDIARELAY_LINKS_LIMIT`,
//!    `MEDIARELAY_ALLOW_ORIGINS` (comma-separated)
//! 2. **Config file**: path via `--config <path>`, or `mediarelay.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8088"
//!
//! [relay]
//! ping_period_ms = 1000
//! ping_timeout = 3            # missed pongs before the connection is dropped
//! links_limit = 2048
//! allow_origins = ["*"]
//! message_type = "binary"     # or "text"
//!
//! [recording]
//! enabled = true
//! dir = "/tmp"
//! container = "webm"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Zero or out-of-range relay values are replaced with their defaults by
//! [`RelayConfig::apply_defaults`]; an unknown `message_type` is rejected.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid message_type {0:?} (expected \"text\" or \"binary\")")]
    InvalidMessageType(String),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8088`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// WebSocket framing used for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    Text,
    #[default]
    Binary,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
        }
    }
}

impl FromStr for MessageType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "binary" => Ok(Self::Binary),
            _ => Err(ConfigError::InvalidMessageType(s.to_string())),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection, heartbeat, and capacity settings for the relay.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Longest wait for the next inbound frame before the peer is considered
    /// gone, in milliseconds (default 10 000). Connections never use less
    /// than `ping_period_ms * (ping_timeout + 1)`.
    #[serde(default = "default_read_deadline_ms")]
    pub read_deadline_ms: u64,
    /// Upper bound on a single socket write in milliseconds (default 10 000).
    #[serde(default = "default_write_deadline_ms")]
    pub write_deadline_ms: u64,
    /// Interval between protocol pings in milliseconds (default 1000).
    #[serde(default = "default_ping_period_ms")]
    pub ping_period_ms: u64,
    /// Maximum inbound message size in bytes (default 16 MiB).
    #[serde(default = "default_read_limit")]
    pub read_limit: usize,
    /// Upper bound on the HTTP upgrade exchange in milliseconds (default 10 000).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Exact-match origin allow-list; `["*"]` accepts every origin.
    #[serde(default = "default_allow_origins")]
    pub allow_origins: Vec<String>,
    /// Socket read buffer in bytes (default 2048).
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    /// Socket write buffer in bytes (default 2048).
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
    /// Maximum concurrent WebSocket links across all sessions (default 2048).
    #[serde(default = "default_links_limit")]
    pub links_limit: usize,
    /// Missed pongs tolerated before a connection times out (1..=10, default 3).
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u32,
    /// `"text"` or `"binary"` (default `"binary"`).
    #[serde(default = "default_message_type")]
    pub message_type: String,
    /// How long a broadcast may wait for room in a slave's queue before that
    /// slave is disconnected, in milliseconds (default 0: no wait).
    #[serde(default)]
    pub slave_queue_timeout_ms: u64,
}

/// Recording store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordingConfig {
    /// Append each master's stream to disk (default true).
    #[serde(default = "default_recording_enabled")]
    pub enabled: bool,
    /// Directory holding one file per session (default `/tmp`).
    #[serde(default = "default_recording_dir")]
    pub dir: String,
    /// Container name used for the file extension and the playback
    /// `Content-Type: video/<container>` (default `webm`).
    #[serde(default = "default_container")]
    pub container: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8088".to_string()
}
fn default_read_deadline_ms() -> u64 {
    10_000
}
fn default_write_deadline_ms() -> u64 {
    10_000
}
fn default_ping_period_ms() -> u64 {
    1000
}
fn default_read_limit() -> usize {
    16 * 1024 * 1024 // 16 MiB
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_allow_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_buffer_size() -> usize {
    2048
}
fn default_links_limit() -> usize {
    2048
}
fn default_ping_timeout() -> u32 {
    3
}
fn default_message_type() -> String {
    "binary".to_string()
}
fn default_recording_enabled() -> bool {
    true
}
fn default_recording_dir() -> String {
    "/tmp".to_string()
}
fn default_container() -> String {
    "webm".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_deadline_ms: default_read_deadline_ms(),
            write_deadline_ms: default_write_deadline_ms(),
            ping_period_ms: default_ping_period_ms(),
            read_limit: default_read_limit(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            allow_origins: default_allow_origins(),
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            links_limit: default_links_limit(),
            ping_timeout: default_ping_timeout(),
            message_type: default_message_type(),
            slave_queue_timeout_ms: 0,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: default_recording_enabled(),
            dir: default_recording_dir(),
            container: default_container(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RelayConfig {
    /// Replace unset (zero/empty) or out-of-range values with defaults.
    pub fn apply_defaults(&mut self) {
        if self.allow_origins.is_empty() {
            self.allow_origins = default_allow_origins();
        }
        if self.ping_period_ms == 0 {
            self.ping_period_ms = default_ping_period_ms();
        }
        if self.read_deadline_ms == 0 {
            self.read_deadline_ms = default_read_deadline_ms();
        }
        if self.write_deadline_ms == 0 {
            self.write_deadline_ms = default_write_deadline_ms();
        }
        if self.handshake_timeout_ms == 0 {
            self.handshake_timeout_ms = default_handshake_timeout_ms();
        }
        if self.read_limit == 0 {
            self.read_limit = default_read_limit();
        }
        if self.read_buffer_size == 0 {
            self.read_buffer_size = default_buffer_size();
        }
        if self.write_buffer_size == 0 {
            self.write_buffer_size = default_buffer_size();
        }
        if self.links_limit == 0 {
            self.links_limit = default_links_limit();
        }
        if self.ping_timeout == 0 || self.ping_timeout > 10 {
            self.ping_timeout = default_ping_timeout();
        }
        if self.message_type.trim().is_empty() {
            self.message_type = default_message_type();
        }
    }

    /// Parse the configured framing mode.
    pub fn message_type(&self) -> Result<MessageType, ConfigError> {
        self.message_type.parse()
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn slave_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.slave_queue_timeout_ms)
    }

    /// Whether `origin` passes the allow-list. A list consisting solely of
    /// `*` accepts everything, including requests without an `Origin` header.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allow_origins.len() == 1 && self.allow_origins[0] == "*" {
            return true;
        }
        origin.is_some_and(|o| self.allow_origins.iter().any(|allowed| allowed == o))
    }
}

impl RecordingConfig {
    pub fn dir_path(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults,
    /// then normalize and validate it.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `mediarelay.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("mediarelay.toml").exists() {
            Self::from_file(Path::new("mediarelay.toml"))?
        } else {
            Config::default()
        };

        config.apply_env()?;
        config.relay.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_toml(&content, &display)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(listen) = std::env::var("MEDIARELAY_LISTEN") {
            self.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("MEDIARELAY_RECORDING_DIR") {
            self.recording.dir = dir;
        }
        if let Ok(limit) = std::env::var("MEDIARELAY_LINKS_LIMIT") {
            self.relay.links_limit = limit.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "MEDIARELAY_LINKS_LIMIT",
                value: limit.clone(),
            })?;
        }
        if let Ok(origins) = std::env::var("MEDIARELAY_ALLOW_ORIGINS") {
            self.relay.allow_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        Ok(())
    }

    /// Reject settings that have no sensible default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay.message_type()?;
        Ok(())
    }
}
