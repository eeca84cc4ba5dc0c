//! Tunnel server binary
//!
//! Accepts agent control channels on `/_tunnel` and dispatches public HTTP
//! and TCP traffic through them.

use anyhow::{Context, Result};
use clap::Parser;
use outpost_proto::FilterMode;
use outpost_server::{
    AuthConfig, DomainRule, IpAccessConfig, PortRange, SelfSignedProvider, Server, ServerConfig,
    TlsConfig,
};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tunnel server - accepts agent connections and routes public traffic
#[derive(Parser, Debug)]
#[command(name = "outpost-server")]
#[command(about = "Run the tunnel server", long_about = None)]
#[command(version)]
struct Cli {
    /// Bind address
    #[arg(long, env = "OUTPOST_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Bind port for the public listener
    #[arg(long, env = "OUTPOST_PORT", default_value = "8080")]
    port: u16,

    /// Port to advertise in public URLs when it differs from --port
    #[arg(long, env = "OUTPOST_PUBLIC_PORT")]
    public_port: Option<u16>,

    /// Public domain (repeatable; first one is used for new tunnels)
    #[arg(long = "domain", env = "OUTPOST_DOMAIN", default_value = "localhost")]
    domains: Vec<String>,

    /// Label between the tunnel subdomain and the domain; empty for
    /// dynamic-DNS style hosts
    #[arg(long, env = "OUTPOST_BASE_PATH", default_value = "op")]
    base_path: String,

    /// Lowest public TCP tunnel port
    #[arg(long, default_value = "10000")]
    tunnel_port_min: u16,

    /// Highest public TCP tunnel port
    #[arg(long, default_value = "20000")]
    tunnel_port_max: u16,

    /// Agent auth token (repeatable; presence makes auth required)
    #[arg(long = "auth-token", env = "OUTPOST_AUTH_TOKEN")]
    auth_tokens: Vec<String>,

    /// IP access mode
    #[arg(long, value_enum, default_value = "all")]
    ip_mode: IpMode,

    /// Allowlist entry, IP or CIDR (repeatable)
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Denylist entry, IP or CIDR (repeatable)
    #[arg(long = "deny")]
    deny: Vec<String>,

    /// Serve TLS with a generated self-signed certificate
    #[arg(long, conflicts_with_all = ["tls_cert", "tls_key"])]
    tls_self_signed: bool,

    /// PEM certificate chain file for TLS
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<std::path::PathBuf>,

    /// PEM private key file for TLS
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<std::path::PathBuf>,

    /// Public IP registered with the DNS provider for new subdomains
    #[arg(long, env = "OUTPOST_PUBLIC_IP")]
    public_ip: Option<IpAddr>,

    /// Largest HTTP body relayed through a tunnel, in bytes
    #[arg(long, default_value = "10485760")]
    max_body_bytes: usize,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum IpMode {
    All,
    Allowlist,
    Denylist,
}

impl From<IpMode> for FilterMode {
    fn from(mode: IpMode) -> Self {
        match mode {
            IpMode::All => FilterMode::All,
            IpMode::Allowlist => FilterMode::Allowlist,
            IpMode::Denylist => FilterMode::Denylist,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,outpost_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let tls = if cli.tls_self_signed {
        TlsConfig::Provider
    } else if let (Some(cert), Some(key)) = (&cli.tls_cert, &cli.tls_key) {
        TlsConfig::Static {
            cert_pem: std::fs::read_to_string(cert)
                .with_context(|| format!("reading {}", cert.display()))?,
            key_pem: std::fs::read_to_string(key)
                .with_context(|| format!("reading {}", key.display()))?,
        }
    } else {
        TlsConfig::Disabled
    };

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        public_port: cli.public_port,
        domains: cli
            .domains
            .iter()
            .map(|domain| DomainRule::new(domain.clone(), cli.base_path.clone()))
            .collect(),
        tunnel_port_range: PortRange {
            min: cli.tunnel_port_min,
            max: cli.tunnel_port_max,
        },
        auth: AuthConfig {
            required: !cli.auth_tokens.is_empty(),
            tokens: cli.auth_tokens,
        },
        ip_access: IpAccessConfig {
            mode: cli.ip_mode.into(),
            allow_list: cli.allow,
            deny_list: cli.deny,
        },
        tls,
        public_ip: cli.public_ip,
        max_body_bytes: cli.max_body_bytes,
        ..Default::default()
    };

    let mut server = Server::new(config).context("invalid server configuration")?;
    if cli.tls_self_signed {
        server = server.with_certificate_provider(Arc::new(SelfSignedProvider::new()));
    }

    let running = server.bind().await.context("failed to start server")?;
    info!("ready on {}", running.local_addr());

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    running.shutdown().await;

    Ok(())
}
