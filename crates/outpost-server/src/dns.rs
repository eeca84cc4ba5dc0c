//! Pluggable DNS records for HTTP tunnels
//!
//! When a provider is configured and the server knows its public IP, each
//! HTTP tunnel gets an A record upserted on creation and deleted on
//! teardown. Calls run off the dispatch path; failures are logged, never
//! fatal to the tunnel.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns provider error: {0}")]
    Provider(String),
}

/// Record management interface implemented by provider integrations.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn upsert(&self, name: &str, ip: std::net::IpAddr) -> Result<(), DnsError>;
    async fn delete(&self, name: &str) -> Result<(), DnsError>;
}

/// Default provider that manages no records.
pub struct NoopDnsProvider;

#[async_trait]
impl DnsProvider for NoopDnsProvider {
    async fn upsert(&self, _name: &str, _ip: std::net::IpAddr) -> Result<(), DnsError> {
        Ok(())
    }

    async fn delete(&self, _name: &str) -> Result<(), DnsError> {
        Ok(())
    }
}
