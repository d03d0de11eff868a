#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # mediarelay
//!
//! WebSocket media relay server.
//!
//! ## Subcommands
//!
//! - `mediarelay serve` (default): run the HTTP/WS server
//! - `mediarelay check`: load and validate the configuration, print the
//!   effective settings as TOML, and exit

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use mediarelay::config::Config;
use mediarelay::routes;
use mediarelay::state::AppState;

/// Real-time WebSocket media relay with recording and range playback.
#[derive(Parser)]
#[command(name = "mediarelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Validate the configuration and print the effective settings.
    Check {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check { config }) => check(config.as_deref()),
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn load_config(config_path: Option<&str>) -> Config {
    match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mediarelay: {e}");
            std::process::exit(2);
        }
    }
}

fn check(config_path: Option<&str>) {
    let config = load_config(config_path);
    match toml::to_string_pretty(&config) {
        Ok(text) => print!("{text}"),
        Err(e) => {
            eprintln!("mediarelay: cannot render config: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = load_config(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("mediarelay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!(
        links_limit = config.relay.links_limit,
        ping_period_ms = config.relay.ping_period_ms,
        ping_timeout = config.relay.ping_timeout,
        message_type = %config.relay.message_type,
        "relay settings"
    );
    if config.recording.enabled {
        info!(dir = %config.recording.dir, container = %config.recording.container, "Recording enabled");
    } else {
        warn!("Recording disabled; playback will only serve existing files");
    }

    let state = AppState::new(config);
    let app = routes::router(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.server.listen);
            std::process::exit(1);
        }
    };

    info!("Server ready");

    // Graceful shutdown: upgraded sockets hold the server open, so sessions
    // are closed as soon as the signal arrives.
    let registry = state.registry.clone();
    let shutdown = async move {
        wait_for_signal().await;
        info!("Shutting down...");
        registry.close_all().await;
    };

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!("Server error: {e}");
    }

    // Sessions created while draining.
    state.registry.close_all().await;
    info!("Goodbye");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
