//! Tunnel registry
//!
//! Indexes live tunnels by id, subdomain, and public TCP port. The three
//! indices are kept consistent under a single mutex; subdomain/port
//! selection runs inside the same critical section so allocation and
//! publication are observed atomically by concurrent lookups.

use crate::alloc::{self, AllocError};
use crate::config::PortRange;
use chrono::{DateTime, Utc};
use outpost_proto::{TunnelProtocol, TunnelSpec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("tunnel id '{0}' already registered")]
    DuplicateId(String),

    #[error("tunnel '{0}' has no public port")]
    NotTcp(String),
}

/// Cumulative per-tunnel traffic counters.
#[derive(Debug, Default)]
pub struct TunnelStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections: AtomicU64,
}

impl TunnelStats {
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

/// A live dispatch rule owned by exactly one agent session.
#[derive(Debug)]
pub struct Tunnel {
    /// Server-assigned opaque id
    pub id: String,
    /// Agent-side name from the tunnel request, echoed in logs
    pub name: String,
    pub protocol: TunnelProtocol,
    pub local_host: String,
    pub local_port: u16,
    /// Set for HTTP tunnels
    pub subdomain: Option<String>,
    /// Set for TCP tunnels
    pub public_port: Option<u16>,
    pub public_url: String,
    /// Session that created the tunnel
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub stats: TunnelStats,
}

impl Tunnel {
    /// Local address the owning agent forwards to.
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<Tunnel>>,
    by_subdomain: HashMap<String, Arc<Tunnel>>,
    by_port: HashMap<u16, Arc<Tunnel>>,
}

/// Shared tunnel registry.
pub struct TunnelRegistry {
    indices: Mutex<Indices>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            indices: Mutex::new(Indices::default()),
        }
    }

    /// Register an HTTP tunnel, choosing its subdomain.
    ///
    /// A requested subdomain is validated and must be unclaimed; with no
    /// request a memorable name is generated, retrying on collision. The
    /// caller supplies `make_url` so the public URL can be derived from the
    /// final name without leaving the critical section.
    pub fn register_http(
        &self,
        spec: &TunnelSpec,
        session_id: &str,
        make_url: impl FnOnce(&str) -> String,
    ) -> Result<Arc<Tunnel>, RegistryError> {
        let mut indices = self.indices.lock().expect("registry lock poisoned");

        let subdomain = match &spec.subdomain {
            Some(requested) => {
                alloc::validate_subdomain(requested)?;
                if indices.by_subdomain.contains_key(requested) {
                    return Err(AllocError::SubdomainInUse(requested.clone()).into());
                }
                requested.clone()
            }
            None => loop {
                let candidate = alloc::generate_subdomain();
                if !indices.by_subdomain.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let tunnel = Arc::new(Tunnel {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.id.clone(),
            protocol: spec.protocol,
            local_host: spec.local_host.clone(),
            local_port: spec.local_port,
            public_url: make_url(&subdomain),
            subdomain: Some(subdomain.clone()),
            public_port: None,
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            stats: TunnelStats::default(),
        });

        indices.by_id.insert(tunnel.id.clone(), tunnel.clone());
        indices.by_subdomain.insert(subdomain, tunnel.clone());

        debug!(tunnel_id = %tunnel.id, url = %tunnel.public_url, "registered http tunnel");
        Ok(tunnel)
    }

    /// Register a TCP tunnel, picking its public port from `range`.
    ///
    /// No index is touched when selection fails, so an exhausted pool leaves
    /// the registry unchanged.
    pub fn register_tcp(
        &self,
        spec: &TunnelSpec,
        session_id: &str,
        range: PortRange,
        make_url: impl FnOnce(u16) -> String,
    ) -> Result<Arc<Tunnel>, RegistryError> {
        let mut indices = self.indices.lock().expect("registry lock poisoned");

        let port = alloc::select_port(
            range,
            |p| indices.by_port.contains_key(&p),
            spec.remote_port,
            spec.local_port,
        )?;

        let tunnel = Arc::new(Tunnel {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.id.clone(),
            protocol: spec.protocol,
            local_host: spec.local_host.clone(),
            local_port: spec.local_port,
            subdomain: None,
            public_port: Some(port),
            public_url: make_url(port),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            stats: TunnelStats::default(),
        });

        indices.by_id.insert(tunnel.id.clone(), tunnel.clone());
        indices.by_port.insert(port, tunnel.clone());

        debug!(tunnel_id = %tunnel.id, port, "registered tcp tunnel");
        Ok(tunnel)
    }

    /// Remove a tunnel by id. Idempotent; returns the evicted tunnel the
    /// first time.
    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        let mut indices = self.indices.lock().expect("registry lock poisoned");

        let tunnel = indices.by_id.remove(tunnel_id)?;
        if let Some(subdomain) = &tunnel.subdomain {
            indices.by_subdomain.remove(subdomain);
        }
        if let Some(port) = tunnel.public_port {
            indices.by_port.remove(&port);
        }

        debug!(tunnel_id, "removed tunnel");
        Some(tunnel)
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.indices
            .lock()
            .expect("registry lock poisoned")
            .by_id
            .get(tunnel_id)
            .cloned()
    }

    pub fn lookup_subdomain(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.indices
            .lock()
            .expect("registry lock poisoned")
            .by_subdomain
            .get(subdomain)
            .cloned()
    }

    pub fn lookup_port(&self, port: u16) -> Option<Arc<Tunnel>> {
        self.indices
            .lock()
            .expect("registry lock poisoned")
            .by_port
            .get(&port)
            .cloned()
    }

    /// Snapshot of all live tunnels, for the stats endpoints.
    pub fn snapshot(&self) -> Vec<Arc<Tunnel>> {
        self.indices
            .lock()
            .expect("registry lock poisoned")
            .by_id
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.indices.lock().expect("registry lock poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_spec(subdomain: Option<&str>) -> TunnelSpec {
        TunnelSpec {
            id: "web".to_string(),
            protocol: TunnelProtocol::Http,
            local_host: "127.0.0.1".to_string(),
            local_port: 3000,
            subdomain: subdomain.map(str::to_string),
            remote_port: None,
        }
    }

    fn tcp_spec(local_port: u16, remote_port: Option<u16>) -> TunnelSpec {
        TunnelSpec {
            id: "db".to_string(),
            protocol: TunnelProtocol::Tcp,
            local_host: "127.0.0.1".to_string(),
            local_port,
            subdomain: None,
            remote_port,
        }
    }

    fn url(subdomain: &str) -> String {
        format!("http://{}.op.example.com", subdomain)
    }

    #[test]
    fn test_register_and_lookup_http() {
        let registry = TunnelRegistry::new();
        let tunnel = registry
            .register_http(&http_spec(Some("web")), "s-1", url)
            .unwrap();

        assert_eq!(tunnel.subdomain.as_deref(), Some("web"));
        assert_eq!(tunnel.public_url, "http://web.op.example.com");

        let found = registry.lookup_subdomain("web").unwrap();
        assert_eq!(found.id, tunnel.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_subdomain_conflict_leaves_registry_unchanged() {
        let registry = TunnelRegistry::new();
        registry
            .register_http(&http_spec(Some("web")), "s-1", url)
            .unwrap();

        let err = registry
            .register_http(&http_spec(Some("web")), "s-2", url)
            .unwrap_err();
        assert!(err.to_string().contains("in use"));
        assert_eq!(registry.len(), 1);

        // the surviving tunnel still belongs to the first session
        assert_eq!(registry.lookup_subdomain("web").unwrap().session_id, "s-1");
    }

    #[test]
    fn test_generated_subdomain_is_registered() {
        let registry = TunnelRegistry::new();
        let tunnel = registry.register_http(&http_spec(None), "s-1", url).unwrap();
        let name = tunnel.subdomain.clone().unwrap();
        assert!(registry.lookup_subdomain(&name).is_some());
    }

    #[test]
    fn test_tcp_local_port_preference_then_scan() {
        let registry = TunnelRegistry::new();
        let range = PortRange::default();

        let first = registry
            .register_tcp(&tcp_spec(15_432, None), "s-1", range, |p| {
                format!("tcp://example.com:{}", p)
            })
            .unwrap();
        assert_eq!(first.public_port, Some(15_432));

        let second = registry
            .register_tcp(&tcp_spec(15_432, None), "s-2", range, |p| {
                format!("tcp://example.com:{}", p)
            })
            .unwrap();
        assert_eq!(second.public_port, Some(10_000));
    }

    #[test]
    fn test_tcp_pool_exhaustion_no_mutation() {
        let registry = TunnelRegistry::new();
        let range = PortRange {
            min: 10_000,
            max: 10_001,
        };
        let mk = |p: u16| format!("tcp://example.com:{}", p);

        registry.register_tcp(&tcp_spec(1, None), "s-1", range, mk).unwrap();
        registry.register_tcp(&tcp_spec(2, None), "s-1", range, mk).unwrap();

        let before = registry.len();
        let err = registry
            .register_tcp(&tcp_spec(3, None), "s-1", range, mk)
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Alloc(AllocError::NoPortsAvailable)
        ));
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn test_remove_is_idempotent_and_frees_keys() {
        let registry = TunnelRegistry::new();
        let range = PortRange::default();
        let mk = |p: u16| format!("tcp://example.com:{}", p);

        let tunnel = registry
            .register_tcp(&tcp_spec(1, Some(10_500)), "s-1", range, mk)
            .unwrap();

        assert!(registry.remove(&tunnel.id).is_some());
        assert!(registry.remove(&tunnel.id).is_none());
        assert!(registry.lookup_port(10_500).is_none());

        // the port is allocatable again
        let again = registry
            .register_tcp(&tcp_spec(1, Some(10_500)), "s-2", range, mk)
            .unwrap();
        assert_eq!(again.public_port, Some(10_500));
    }

    #[test]
    fn test_concurrent_subdomain_claims_single_winner() {
        let registry = Arc::new(TunnelRegistry::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry
                    .register_http(&http_spec(Some("web")), &format!("s-{}", i), url)
                    .is_ok()
            }));
        }

        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stats_counters() {
        let stats = TunnelStats::default();
        stats.add_bytes_in(10);
        stats.add_bytes_in(5);
        stats.add_bytes_out(7);
        stats.add_connection();

        assert_eq!(stats.bytes_in(), 15);
        assert_eq!(stats.bytes_out(), 7);
        assert_eq!(stats.connections(), 1);
    }
}
