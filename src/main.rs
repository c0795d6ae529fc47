//! RustyConnector proxy node
//!
//! Runs the proxy side of the magic link: loaders register over the shared
//! channel, heartbeat, and are grouped into families that players are routed
//! into.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────┐
//!                     │                    PROXY NODE                    │
//!                     │                                                  │
//!   loaders ──────────┼─▶ transport ──▶ link::channel ──▶ link::handlers │
//!   (REGISTER,        │   (memory /     (decode, verify,     │           │
//!    HEARTBEAT, ...)  │    tcp relay)    replay, dispatch)   ▼           │
//!                     │                                  family tree     │
//!   players ──────────┼─▶ Proxy::connect_player ───────▶ load_balancer   │
//!                     │                                      │           │
//!                     │   link::sessions (liveness) ─────────┤           │
//!                     │   scaling::clock (rebalance) ────────┘──▶ events │
//!                     │                                                  │
//!                     │   config (+ hot reload) · observability · cache  │
//!                     └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use rusty_connector::config::{load_config, ConfigWatcher, LinkConfig, TransportKind};
use rusty_connector::observability::{logging, metrics};
use rusty_connector::transport::{BusRelay, MemoryBus, MessageBus, TcpBus};
use rusty_connector::{Proxy, Shutdown};

#[derive(Parser)]
#[command(name = "rusty-connector")]
#[command(about = "Magic link proxy node", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also host the TCP bus relay on this node
    #[arg(long)]
    relay: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => LinkConfig::default(),
    };
    logging::init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        channel = %config.link.channel,
        transport = ?config.transport.kind,
        families = config.families.len(),
        "rusty-connector starting"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let shutdown = Shutdown::new();

    if cli.relay {
        let bind = config
            .transport
            .relay_bind
            .clone()
            .unwrap_or_else(|| config.transport.address.clone());
        let relay = BusRelay::bind(&bind, config.transport.subscriber_buffer).await?;
        tracing::info!(address = %relay.local_addr()?, "Bus relay listening");
        tokio::spawn(relay.run(shutdown.subscribe()));
    }

    let bus: Arc<dyn MessageBus> = match config.transport.kind {
        TransportKind::Memory => Arc::new(MemoryBus::from_config(
            config.link.channel.clone(),
            &config.transport,
        )),
        TransportKind::Tcp => Arc::new(TcpBus::connect(
            config.link.channel.clone(),
            &config.transport,
            shutdown.subscribe(),
        )),
    };

    let proxy = Proxy::new(&config, bus)?;
    proxy.start();

    // Keep the watcher alive for the life of the process.
    let mut _watcher = None;
    let mut updates = None;
    if let Some(path) = &cli.config {
        let (watcher, rx) = ConfigWatcher::new(path);
        match watcher.run() {
            Ok(handle) => {
                _watcher = Some(handle);
                updates = Some(rx);
            }
            Err(e) => tracing::warn!(error = %e, "Config hot reload disabled"),
        }
    }

    loop {
        tokio::select! {
            Some(reloaded) = async {
                match updates.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                proxy.apply_config(&reloaded);
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                }
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    proxy.stop().await;
    shutdown.trigger();
    tracing::info!("Shutdown complete");
    Ok(())
}
