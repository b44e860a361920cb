//! CORS-enabling reverse proxy (v1)
//!
//! Forwards every request to one configured upstream, answers CORS
//! preflights itself, and tunnels websocket upgrades to the backend.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────┐
//!                        │                   PROXY                      │
//!     Client Request     │  ┌─────────┐   ┌────────┐   ┌────────────┐   │
//!     ───────────────────┼─▶│  http   │──▶│  cors  │──▶│  dispatch  │   │
//!                        │  │ server  │   │        │   └─────┬──────┘   │
//!                        │  └─────────┘   └────────┘         │          │
//!                        │                       ┌───────────┴───────┐  │
//!                        │                       ▼                   ▼  │
//!                        │                ┌────────────┐   ┌───────────┐│
//!                        │                │  forward   │   │ websocket ││──── Backend
//!                        │                │ (one req)  │   │  tunnel   ││
//!                        │                └────────────┘   └───────────┘│
//!                        │  config · observability · lifecycle          │
//!                        └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use cors_ws_proxy::config::{load_config, ProxyConfig};
use cors_ws_proxy::lifecycle::{spawn_signal_handler, Shutdown};
use cors_ws_proxy::observability::init_logging;
use cors_ws_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "cors-ws-proxy")]
#[command(about = "Reverse proxy that adds CORS headers and tunnels websockets", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream base URL, overrides the config file
    #[arg(short, long)]
    upstream: Option<String>,

    /// Listen address, overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level, overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(url) = cli.upstream {
        config.upstream.url = url;
    }
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    init_logging(&config.observability)?;
    tracing::info!("cors-ws-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    let server = HttpServer::new(config)?;

    tracing::info!(
        bind_address = %server.config().listener.bind_address,
        upstream = %server.config().upstream.url,
        preserve_host = server.config().upstream.preserve_host,
        "Configuration loaded"
    );

    let listener = TcpListener::bind(&server.config().listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let _signals = spawn_signal_handler(&shutdown);

    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
