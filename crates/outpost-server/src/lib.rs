//! Tunnel server
//!
//! Publicly reachable side of the tunnel system: accepts control channels
//! from agents on `/_tunnel`, registers tunnels, and dispatches public HTTP
//! requests and TCP connections through them.

pub mod alloc;
pub mod config;
pub mod correlator;
pub mod dns;
pub mod fraud;
pub mod http;
pub mod registry;
pub mod server;
pub mod session;
pub mod tcp;
pub mod tls;

pub use config::{AuthConfig, DomainRule, IpAccessConfig, PortRange, ServerConfig, TlsConfig};
pub use dns::{DnsError, DnsProvider, NoopDnsProvider};
pub use fraud::{AllowAllPredicate, CachedPredicate, FraudPredicate, Verdict};
pub use registry::{Tunnel, TunnelRegistry};
pub use server::{RunningServer, Server, ServerError};
pub use session::SessionManager;
pub use tls::{CertBundle, CertError, CertificateProvider, SelfSignedProvider, StaticCertProvider};
