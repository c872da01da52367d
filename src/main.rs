//! Federated search broker.
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────┐
//!   Client search     │                      BROKER                          │
//!   ──────────────────┼─▶ http ─▶ admission ─▶ strategy ─▶ resolution        │
//!                     │                                      │               │
//!                     │                                      ▼               │
//!                     │                       optimizer (server subset)      │
//!                     │                                      │               │
//!                     │                                      ▼               │
//!                     │             orchestrator ─▶ circuit breaker ─────────┼──▶ Server A
//!                     │                  │                   ├───────────────┼──▶ Server B
//!                     │                  ▼                   └───────────────┼──▶ Server C
//!   Merged page       │          aggregation (k-way merge)                   │
//!   ◀─────────────────┼── continuation token                                 │
//!                     └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use fanout_broker::config::loader::load_config;
use fanout_broker::config::watcher::ConfigWatcher;
use fanout_broker::config::BrokerConfig;
use fanout_broker::lifecycle::{wait_for_signal, Shutdown};
use fanout_broker::observability::{logging, metrics};
use fanout_broker::HttpServer;

#[derive(Parser)]
#[command(name = "fanout-broker")]
#[command(about = "Federated search broker", long_about = None)]
struct Args {
    /// TOML configuration file. Watched for changes.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => BrokerConfig::default(),
    };
    logging::init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        servers = config.servers.len(),
        chained_mode = ?config.resolution.chained_mode,
        include_mode = ?config.resolution.include_mode,
        "fanout-broker starting"
    );
    if config.servers.is_empty() {
        tracing::warn!("No backend servers configured; every search will fail");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    // The watcher must stay alive for reloads to arrive.
    let (config_updates, _watcher) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (updates, Some(watcher.run()?))
        }
        None => {
            let (_, updates) = mpsc::unbounded_channel();
            (updates, None)
        }
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.trigger();
    });

    server.run(listener, config_updates, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
