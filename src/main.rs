//! WebSocket reverse proxy.
//!
//! Accepts WebSocket upgrades on one listener and relays each connection to
//! a single backend.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────┐
//!                    │                 WEBSOCKET PROXY                  │
//!                    │                                                  │
//!   Client upgrade   │  ┌─────────┐    ┌──────────┐    ┌────────────┐   │
//!   ─────────────────┼─▶│  http   │───▶│websocket │───▶│   dialer   │───┼──▶ Backend
//!                    │  │ server  │    │  proxy   │    │ (director) │   │
//!                    │  └─────────┘    └────┬─────┘    └────────────┘   │
//!                    │                      │ 101                       │
//!                    │                      ▼                           │
//!   Client frames    │               ┌──────────────┐                   │
//!   ◀────────────────┼──────────────▶│session/relay │◀──────────────────┼──▶ Backend frames
//!                    │               └──────────────┘                   │
//!                    │                                                  │
//!                    │  config · observability · lifecycle              │
//!                    └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use websocket_proxy::config::{self, ConfigError, ProxyConfig};
use websocket_proxy::observability::{logging, metrics};
use websocket_proxy::{HttpServer, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "websocket-proxy")]
#[command(about = "Reverse proxy for WebSocket connections", long_about = None)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override `upstream.target`.
    #[arg(short, long)]
    target: Option<String>,
}

impl Cli {
    fn load(&self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(listen) = &self.listen {
            config.listener.bind_address = listen.clone();
        }
        if let Some(target) = &self.target {
            config.upstream.target = target.clone();
        }

        config::validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.load()?;

    logging::init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        target = %config.upstream.target,
        "websocket-proxy starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(err) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %err,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;

    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();
    tokio::spawn(async move { shutdown.trigger_on_ctrl_c().await });

    HttpServer::new(config)?.run(listener, stop).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
