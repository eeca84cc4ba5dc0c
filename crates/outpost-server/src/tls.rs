//! TLS termination for the public listener
//!
//! Certificates come from a [`CertificateProvider`]: externally supplied PEM
//! blobs, locally generated self-signed certificates, or an ACME client
//! living outside this crate. Renewal is scheduled at `not_after - 7 days`
//! and swaps the acceptor without touching in-flight connections.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// TLS errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate provider error: {0}")]
    Provider(String),

    #[error("invalid PEM material: {0}")]
    InvalidPem(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// A certificate, its key, and when the provider wants it replaced.
#[derive(Debug, Clone)]
pub struct CertBundle {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

/// Source of certificates for the public listener.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Obtain (or mint) a certificate covering `domains`.
    async fn obtain(&self, domains: &[String]) -> Result<CertBundle, CertError>;

    /// Body of an HTTP-01 challenge response for `token`, when this
    /// provider is in the middle of an ACME order.
    fn challenge_response(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Wraps externally supplied PEM blobs in the provider interface.
pub struct StaticCertProvider {
    bundle: CertBundle,
}

impl StaticCertProvider {
    /// External material is renewed out of band, so the bundle is declared
    /// valid far enough out that the renewal loop stays dormant.
    pub fn new(cert_pem: String, key_pem: String) -> Self {
        Self {
            bundle: CertBundle {
                cert_pem,
                key_pem,
                not_after: Utc::now() + ChronoDuration::days(365 * 10),
            },
        }
    }
}

#[async_trait]
impl CertificateProvider for StaticCertProvider {
    async fn obtain(&self, _domains: &[String]) -> Result<CertBundle, CertError> {
        Ok(self.bundle.clone())
    }
}

/// Generates and caches a self-signed certificate for local use.
pub struct SelfSignedProvider {
    cached: tokio::sync::Mutex<Option<CertBundle>>,
}

impl SelfSignedProvider {
    pub fn new() -> Self {
        Self {
            cached: tokio::sync::Mutex::new(None),
        }
    }
}

impl Default for SelfSignedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateProvider for SelfSignedProvider {
    async fn obtain(&self, domains: &[String]) -> Result<CertBundle, CertError> {
        let mut cached = self.cached.lock().await;
        if let Some(bundle) = cached.as_ref() {
            return Ok(bundle.clone());
        }

        let mut names: Vec<String> = domains.to_vec();
        if names.is_empty() {
            names.push("localhost".to_string());
        }
        // cover one wildcard level under each domain
        let wildcards: Vec<String> = names.iter().map(|d| format!("*.{}", d)).collect();
        names.extend(wildcards);

        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
            .map_err(|e| CertError::Provider(format!("self-signed generation failed: {}", e)))?;

        let bundle = CertBundle {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            not_after: Utc::now() + ChronoDuration::days(90),
        };
        info!("generated self-signed certificate");

        *cached = Some(bundle.clone());
        Ok(bundle)
    }
}

/// Install the ring crypto provider for this process. Later calls are
/// no-ops, so every TLS entry point can call it unconditionally.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build a rustls server config from a PEM bundle.
pub fn build_server_config(bundle: &CertBundle) -> Result<rustls::ServerConfig, CertError> {
    install_crypto_provider();
    let certs = rustls_pemfile::certs(&mut bundle.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidPem(format!("certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(CertError::InvalidPem(
            "no certificates in PEM bundle".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut bundle.key_pem.as_bytes())
        .map_err(|e| CertError::InvalidPem(format!("private key: {}", e)))?
        .ok_or_else(|| CertError::InvalidPem("no private key in PEM bundle".to_string()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CertError::Tls(e.to_string()))?;

    // tunneled HTTP is parsed as HTTP/1.1; keep h2 off the public path
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Hot-swappable TLS acceptor shared by the accept loop and the renewal
/// task.
pub struct TlsState {
    acceptor: RwLock<TlsAcceptor>,
}

impl TlsState {
    pub fn new(bundle: &CertBundle) -> Result<Self, CertError> {
        let config = build_server_config(bundle)?;
        Ok(Self {
            acceptor: RwLock::new(TlsAcceptor::from(Arc::new(config))),
        })
    }

    pub async fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.read().await.clone()
    }

    pub async fn reload(&self, bundle: &CertBundle) -> Result<(), CertError> {
        let config = build_server_config(bundle)?;
        *self.acceptor.write().await = TlsAcceptor::from(Arc::new(config));
        info!("reloaded TLS certificate");
        Ok(())
    }
}

/// Renew `not_after - 7 days` before expiry, forever.
///
/// Runs off the data path; a failed renewal is retried hourly until the
/// provider succeeds.
pub fn spawn_renewal(
    provider: Arc<dyn CertificateProvider>,
    domains: Vec<String>,
    tls_state: Arc<TlsState>,
    mut not_after: DateTime<Utc>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let renew_at = not_after - ChronoDuration::days(7);
            let wait = (renew_at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(wait).await;

            match provider.obtain(&domains).await {
                Ok(bundle) => match tls_state.reload(&bundle).await {
                    Ok(()) => {
                        info!(not_after = %bundle.not_after, "certificate renewed");
                        not_after = bundle.not_after;
                    }
                    Err(e) => {
                        error!("renewed certificate rejected: {}", e);
                        not_after = Utc::now() + ChronoDuration::hours(1) + ChronoDuration::days(7);
                    }
                },
                Err(e) => {
                    warn!("certificate renewal failed, retrying in an hour: {}", e);
                    not_after = Utc::now() + ChronoDuration::hours(1) + ChronoDuration::days(7);
                }
            }
        }
    })
}
