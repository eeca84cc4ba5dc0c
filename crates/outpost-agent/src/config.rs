//! Agent configuration

use outpost_proto::{TunnelProtocol, TunnelSpec, CONTROL_PATH};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("invalid tunnel spec '{spec}': {reason}")]
    InvalidTunnelSpec { spec: String, reason: String },
}

/// One tunnel the agent wants to keep open.
///
/// The desired set is authoritative: after every reconnect the agent
/// re-issues a `tunnel_request` for each slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelSlot {
    pub name: String,
    pub protocol: TunnelProtocol,
    pub local_host: String,
    pub local_port: u16,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_autostart() -> bool {
    true
}

impl TunnelSlot {
    pub fn to_spec(&self) -> TunnelSpec {
        TunnelSpec {
            id: self.name.clone(),
            protocol: self.protocol,
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            subdomain: self.subdomain.clone(),
            remote_port: self.remote_port,
        }
    }

    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn origin_is_tls(&self) -> bool {
        self.protocol == TunnelProtocol::Https
    }
}

/// Compact CLI form: `name:protocol:local_host:local_port[:extra]` where
/// `extra` is a subdomain for http/https and a remote port for tcp.
impl FromStr for TunnelSlot {
    type Err = ConfigError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| ConfigError::InvalidTunnelSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() < 4 || parts.len() > 5 {
            return Err(err(
                "expected name:protocol:local_host:local_port[:subdomain|:remote_port]",
            ));
        }

        let protocol = match parts[1] {
            "http" => TunnelProtocol::Http,
            "https" => TunnelProtocol::Https,
            "tcp" => TunnelProtocol::Tcp,
            other => return Err(err(&format!("unknown protocol '{}'", other))),
        };
        let local_port: u16 = parts[3]
            .parse()
            .map_err(|_| err("local_port is not a port number"))?;

        let mut slot = TunnelSlot {
            name: parts[0].to_string(),
            protocol,
            local_host: parts[2].to_string(),
            local_port,
            subdomain: None,
            remote_port: None,
            autostart: true,
        };

        if let Some(extra) = parts.get(4) {
            match protocol {
                TunnelProtocol::Tcp => {
                    slot.remote_port = Some(
                        extra
                            .parse()
                            .map_err(|_| err("remote_port is not a port number"))?,
                    );
                }
                TunnelProtocol::Http | TunnelProtocol::Https => {
                    slot.subdomain = Some(extra.to_string());
                }
            }
        }

        Ok(slot)
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control endpoint, `ws://` / `wss://` (or `http(s)://`, rewritten)
    pub server_url: String,
    pub token: Option<String>,
    /// Re-dial after a dropped control channel
    pub reconnect: bool,
    /// Verify the server's TLS certificate
    pub reject_unauthorized: bool,
    pub tunnels: Vec<TunnelSlot>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            token: None,
            reconnect: true,
            reject_unauthorized: true,
            tunnels: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Normalize the configured server URL into the control endpoint URL.
    pub fn control_url(&self) -> Result<Url, ConfigError> {
        let err = |reason: String| ConfigError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.server_url).map_err(|e| err(e.to_string()))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(err(format!("unsupported scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| err("could not normalize scheme".to_string()))?;

        if url.path() == "/" || url.path().is_empty() {
            url.set_path(CONTROL_PATH);
        }

        if url.host_str().is_none() {
            return Err(err("missing host".to_string()));
        }

        Ok(url)
    }
}

/// Reconnect backoff: `1s * 2^(n-1)`, capped at 30 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5);
    Duration::from_secs((1u64 << exponent).min(30))
}
