//! Tunnel agent binary
//!
//! Connects to a tunnel server, keeps the configured tunnels open, and
//! forwards dispatched traffic to local services.

use anyhow::{Context, Result};
use clap::Parser;
use outpost_agent::{Agent, AgentConfig, TunnelSlot};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tunnel agent - exposes local services through a tunnel server
#[derive(Parser, Debug)]
#[command(name = "outpost-agent")]
#[command(about = "Run the tunnel agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Server control endpoint, e.g. wss://tunnel.example.com
    #[arg(long, env = "OUTPOST_SERVER_URL", default_value = "ws://localhost:8080")]
    server_url: String,

    /// Auth token, when the server requires one
    #[arg(long, env = "OUTPOST_TOKEN")]
    token: Option<String>,

    /// Exit instead of reconnecting when the channel drops
    #[arg(long)]
    no_reconnect: bool,

    /// Skip TLS certificate verification (self-signed servers)
    #[arg(long)]
    insecure: bool,

    /// Tunnel to open: name:protocol:local_host:local_port[:subdomain|:remote_port]
    /// (repeatable), e.g. web:http:127.0.0.1:3000:web or db:tcp:127.0.0.1:5432:15432
    #[arg(long = "tunnel", required = true)]
    tunnels: Vec<TunnelSlot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,outpost_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = AgentConfig {
        server_url: cli.server_url,
        token: cli.token,
        reconnect: !cli.no_reconnect,
        reject_unauthorized: !cli.insecure,
        tunnels: cli.tunnels,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    Agent::new(config)
        .run_until(shutdown_rx)
        .await
        .context("agent failed")
}
