//! Server configuration

use outpost_proto::{FilterMode, TunnelProtocol};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Default label between a tunnel subdomain and the base domain.
pub const DEFAULT_BASE_PATH: &str = "op";

/// A public domain the server answers for.
///
/// `base_path` is the fixed label inserted between the per-tunnel subdomain
/// and the domain (`web.op.example.com`). An empty `base_path` means tunnels
/// hang directly off the domain (`web.example.com`), the shape used with
/// dynamic-DNS hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainRule {
    pub domain: String,
    #[serde(default)]
    pub base_path: String,
}

impl DomainRule {
    pub fn new(domain: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            base_path: base_path.into(),
        }
    }

    /// Hostname of the apex for this rule.
    pub fn apex(&self) -> String {
        if self.base_path.is_empty() {
            self.domain.clone()
        } else {
            format!("{}.{}", self.base_path, self.domain)
        }
    }

    /// Suffix a tunneled hostname must end with, including the leading dot.
    pub fn tunnel_suffix(&self) -> String {
        format!(".{}", self.apex())
    }
}

/// Inclusive public port range for TCP tunnels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 10_000,
            max: 20_000,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn len(&self) -> usize {
        (self.max as usize).saturating_sub(self.min as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }
}

/// Control channel authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub required: bool,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// IP access rules applied to control channels and public HTTP requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpAccessConfig {
    #[serde(default)]
    pub mode: FilterMode,
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub deny_list: Vec<String>,
}

/// How the public listener terminates connections.
#[derive(Debug, Clone, Default)]
pub enum TlsConfig {
    /// Plain HTTP (development)
    #[default]
    Disabled,
    /// Externally supplied certificate and key, PEM blobs
    Static { cert_pem: String, key_pem: String },
    /// Certificates come from the configured [`CertificateProvider`];
    /// renewal is scheduled at `not_after - 7 days`
    Provider,
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsConfig::Disabled)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the public listener
    pub host: IpAddr,
    /// Bind port for the public listener (0 picks an ephemeral port)
    pub port: u16,
    /// Port advertised in public URLs when it differs from `port`
    /// (e.g. behind a load balancer)
    pub public_port: Option<u16>,
    /// Ordered domain rules; the first match wins
    pub domains: Vec<DomainRule>,
    /// Public port pool for TCP tunnels
    pub tunnel_port_range: PortRange,
    pub auth: AuthConfig,
    pub ip_access: IpAccessConfig,
    pub tls: TlsConfig,
    /// Public IP handed to the DNS provider for subdomain records
    pub public_ip: Option<IpAddr>,
    /// Largest request or response body relayed through an HTTP tunnel
    pub max_body_bytes: usize,
    /// How long the dispatcher waits for an agent's `http_response`
    pub request_timeout: Duration,
    /// TTL for cached fraud predicate verdicts
    pub fraud_cache_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            public_port: None,
            domains: vec![DomainRule::new("localhost", DEFAULT_BASE_PATH)],
            tunnel_port_range: PortRange::default(),
            auth: AuthConfig::default(),
            ip_access: IpAccessConfig::default(),
            tls: TlsConfig::Disabled,
            public_ip: None,
            max_body_bytes: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            fraud_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Scheme of public tunnel URLs.
    pub fn public_scheme(&self) -> &'static str {
        if self.tls.is_enabled() {
            "https"
        } else {
            "http"
        }
    }

    /// Port advertised in public URLs.
    pub fn advertised_port(&self) -> u16 {
        self.public_port.unwrap_or(self.port)
    }

    /// Public URL for an HTTP tunnel on `subdomain` under `rule`.
    ///
    /// The port is omitted when it is the scheme default (443 for https,
    /// 80 for http).
    pub fn http_public_url(&self, rule: &DomainRule, subdomain: &str) -> String {
        let scheme = self.public_scheme();
        let port = self.advertised_port();
        let host = format!("{}{}", subdomain, rule.tunnel_suffix());
        let default_port = if self.tls.is_enabled() { 443 } else { 80 };
        if port == default_port {
            format!("{}://{}", scheme, host)
        } else {
            format!("{}://{}:{}", scheme, host, port)
        }
    }

    /// Informational URL for a TCP tunnel.
    pub fn tcp_public_url(&self, public_port: u16) -> String {
        let domain = self
            .domains
            .first()
            .map(|rule| rule.domain.clone())
            .unwrap_or_else(|| "localhost".to_string());
        format!("tcp://{}:{}", domain, public_port)
    }

    /// The domain rule new HTTP tunnels are published under.
    pub fn primary_domain(&self) -> &DomainRule {
        // A config with no domains is rejected at startup.
        &self.domains[0]
    }

    /// Public URL for a tunnel of the given protocol.
    pub fn public_url_for(
        &self,
        protocol: TunnelProtocol,
        subdomain: Option<&str>,
        public_port: Option<u16>,
    ) -> String {
        match protocol {
            TunnelProtocol::Http | TunnelProtocol::Https => {
                self.http_public_url(self.primary_domain(), subdomain.unwrap_or_default())
            }
            TunnelProtocol::Tcp => self.tcp_public_url(public_port.unwrap_or_default()),
        }
    }
}
