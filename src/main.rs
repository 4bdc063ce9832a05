//! Edge reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ─────────────▶ http server ──▶ pipeline ──▶ mapper (routing decision)
//!                                       │
//!                 ┌─────────────┬───────┼──────────────┬───────────────┐
//!                 ▼             ▼       ▼              ▼               ▼
//!             not found      static   redirect    content cache   forwarder
//!             / error page   page                   (hit)            │
//!                                                                    ▼
//!                                                  pool registry ──▶ backend
//!                                                        │
//!                                   failure reporter ◀───┘ (connect / stuck)
//!
//!     Cross-cutting: config + hot reload, tracing, metrics, access log, shutdown
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;

use edge_proxy::config::{load_config, ConfigWatcher};
use edge_proxy::lifecycle::{wait_for_shutdown, Shutdown};
use edge_proxy::observability::{logging::init_logging, metrics::init_metrics};
use edge_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "edge-proxy")]
#[command(about = "Caching reverse proxy", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "edge-proxy.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if cli.validate {
        println!("{}: configuration is valid", cli.config.display());
        return ExitCode::SUCCESS;
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "edge-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = match TcpListener::bind(&config.listener.bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %config.listener.bind_address, error = %e, "Failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    let (watcher, updates) = ConfigWatcher::new(&cli.config);
    let _watcher = match watcher.run() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Config hot reload disabled");
            None
        }
    };

    let server = match HttpServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build server");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    let mut server_task = tokio::spawn(server.run(listener, updates, shutdown.subscribe()));

    let result = tokio::select! {
        result = &mut server_task => result,
        _ = wait_for_shutdown() => {
            shutdown.trigger();
            server_task.await
        }
    };

    match result {
        Ok(Ok(())) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "Server task panicked");
            ExitCode::FAILURE
        }
    }
}
