//! Public listener and server lifecycle
//!
//! One listener multiplexes everything public: `/_tunnel` upgrades into the
//! control channel, every other path goes through the HTTP dispatcher. With
//! TLS enabled the server also binds port 80 for HTTP→HTTPS redirects and
//! HTTP-01 challenge responses.

use crate::config::{ServerConfig, TlsConfig};
use crate::dns::{DnsProvider, NoopDnsProvider};
use crate::fraud::{AllowAllPredicate, CachedPredicate, FraudPredicate};
use crate::registry::TunnelRegistry;
use crate::session::SessionManager;
use crate::tls::{CertError, CertificateProvider, StaticCertProvider, TlsState};
use crate::{http, session};
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use outpost_proto::{IpAccessPolicy, CONTROL_PATH};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    IpFilter(#[from] outpost_proto::IpFilterError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state behind every handler.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<TunnelRegistry>,
    pub sessions: Arc<SessionManager>,
    pub ip_policy: IpAccessPolicy,
    pub fraud: Arc<dyn FraudPredicate>,
    pub dns: Arc<dyn DnsProvider>,
    pub started_at: Instant,
}

/// Server builder.
pub struct Server {
    config: ServerConfig,
    ip_policy: IpAccessPolicy,
    cert_provider: Option<Arc<dyn CertificateProvider>>,
    dns: Arc<dyn DnsProvider>,
    fraud: Option<Arc<dyn FraudPredicate>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        if config.domains.is_empty() {
            return Err(ServerError::InvalidConfig(
                "at least one domain is required".to_string(),
            ));
        }
        if config.tunnel_port_range.is_empty() {
            return Err(ServerError::InvalidConfig(
                "tunnel port range must not be empty".to_string(),
            ));
        }
        if config.auth.required && config.auth.tokens.is_empty() {
            return Err(ServerError::InvalidConfig(
                "auth is required but no tokens are configured".to_string(),
            ));
        }

        let ip_policy = IpAccessPolicy::new(
            config.ip_access.mode,
            config.ip_access.allow_list.clone(),
            config.ip_access.deny_list.clone(),
        )?;

        Ok(Self {
            config,
            ip_policy,
            cert_provider: None,
            dns: Arc::new(NoopDnsProvider),
            fraud: None,
        })
    }

    pub fn with_certificate_provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.cert_provider = Some(provider);
        self
    }

    pub fn with_dns_provider(mut self, provider: Arc<dyn DnsProvider>) -> Self {
        self.dns = provider;
        self
    }

    pub fn with_fraud_predicate(mut self, predicate: Arc<dyn FraudPredicate>) -> Self {
        self.fraud = Some(predicate);
        self
    }

    /// Bind the public listener(s) and start serving.
    pub async fn bind(self) -> Result<RunningServer, ServerError> {
        let Server {
            mut config,
            ip_policy,
            cert_provider,
            dns,
            fraud,
        } = self;

        crate::tls::install_crypto_provider();

        // resolve the certificate source before accepting anything
        let tls = match &config.tls {
            TlsConfig::Disabled => None,
            TlsConfig::Static { cert_pem, key_pem } => Some(Arc::new(StaticCertProvider::new(
                cert_pem.clone(),
                key_pem.clone(),
            )) as Arc<dyn CertificateProvider>),
            TlsConfig::Provider => Some(cert_provider.clone().ok_or_else(|| {
                ServerError::InvalidConfig(
                    "TLS mode `provider` needs a certificate provider".to_string(),
                )
            })?),
        };

        let bind_addr = SocketAddr::new(config.host, config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        // ephemeral binds learn their real port before URLs are minted
        config.port = local_addr.port();

        let fraud: Arc<dyn FraudPredicate> = match fraud {
            Some(predicate) => Arc::new(CachedPredicate::new(predicate, config.fraud_cache_ttl)),
            None => Arc::new(AllowAllPredicate),
        };

        let state = Arc::new(AppState {
            registry: Arc::new(TunnelRegistry::new()),
            sessions: Arc::new(SessionManager::new()),
            ip_policy,
            fraud,
            dns,
            started_at: Instant::now(),
            config,
        });

        let app = Router::new()
            .route(CONTROL_PATH, get(session::ws_handler))
            .fallback(http::dispatch)
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        match tls {
            None => {
                info!("listening on http://{}", local_addr);
                let rx = shutdown_rx.clone();
                tasks.push(tokio::spawn(serve_plain(listener, app, rx)));
            }
            Some(provider) => {
                let mut domains: Vec<String> = Vec::new();
                for rule in &state.config.domains {
                    for name in [rule.domain.clone(), rule.apex()] {
                        if !domains.contains(&name) {
                            domains.push(name);
                        }
                    }
                }

                let bundle = provider.obtain(&domains).await?;
                let tls_state = Arc::new(TlsState::new(&bundle)?);
                tasks.push(crate::tls::spawn_renewal(
                    provider.clone(),
                    domains,
                    tls_state.clone(),
                    bundle.not_after,
                ));

                info!("listening on https://{}", local_addr);
                tasks.push(tokio::spawn(serve_tls(
                    listener,
                    app,
                    tls_state,
                    shutdown_rx.clone(),
                )));

                // port 80 answers challenges and redirects everything else
                match TcpListener::bind(SocketAddr::new(state.config.host, 80)).await {
                    Ok(redirect_listener) => {
                        let router = redirect_router(provider, state.config.advertised_port());
                        tasks.push(tokio::spawn(serve_redirect(
                            redirect_listener,
                            router,
                            shutdown_rx.clone(),
                        )));
                    }
                    Err(e) => {
                        warn!("could not bind port 80 for redirect/challenges: {}", e);
                    }
                }
            }
        }

        Ok(RunningServer {
            local_addr,
            state,
            shutdown_tx,
            tasks,
        })
    }
}

/// A bound, serving server.
pub struct RunningServer {
    local_addr: SocketAddr,
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Stop accepting, tear down every session and tunnel, abort serving
    /// tasks.
    pub async fn shutdown(self) {
        info!("server shutting down");
        let _ = self.shutdown_tx.send(true);

        // tear tunnels down first so public ports free up, then tell each
        // agent to go away; agents treat this as a normal disconnect
        for agent in self.state.sessions.all() {
            for tunnel_id in agent.owned_tunnels() {
                session::teardown_tunnel(&self.state, &agent, &tunnel_id).await;
            }
            agent
                .close(axum::extract::ws::close_code::AWAY, "server shutting down")
                .await;
        }
        for tunnel in self.state.registry.snapshot() {
            self.state.registry.remove(&tunnel.id);
        }

        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Run until the serving tasks end (they normally never do).
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("server task failed: {}", e);
                }
            }
        }
    }
}

async fn serve_plain(listener: TcpListener, app: Router, mut shutdown: watch::Receiver<bool>) {
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, make_service)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        error!("public listener failed: {}", e);
    }
}

/// TLS accept loop: terminate, then hand the stream to hyper with upgrade
/// support so `/_tunnel` WebSockets keep working.
async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls_state: Arc<TlsState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp_stream, remote_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("tls accept failed: {}", e);
                continue;
            }
        };

        let acceptor = tls_state.acceptor().await;
        let tower_service = match make_service.call(remote_addr).await {
            Ok(service) => service,
            Err(infallible) => match infallible {},
        };

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%remote_addr, "tls handshake failed: {}", e);
                    return;
                }
            };

            let stream = hyper_util::rt::TokioIo::new(tls_stream);
            let hyper_service =
                hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                    tower::ServiceExt::oneshot(tower_service.clone(), request)
                });

            if let Err(e) =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                    .serve_connection_with_upgrades(stream, hyper_service)
                    .await
            {
                debug!(%remote_addr, "connection ended with error: {}", e);
            }
        });
    }
}

async fn serve_redirect(listener: TcpListener, app: Router, mut shutdown: watch::Receiver<bool>) {
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        warn!("redirect listener failed: {}", e);
    }
}

#[derive(Clone)]
struct RedirectState {
    provider: Arc<dyn CertificateProvider>,
    https_port: u16,
}

/// Port-80 router: HTTP-01 challenge responses plus HTTP→HTTPS redirect.
fn redirect_router(provider: Arc<dyn CertificateProvider>, https_port: u16) -> Router {
    Router::new()
        .route(
            "/.well-known/acme-challenge/{token}",
            get(challenge_response),
        )
        .fallback(redirect_to_https)
        .with_state(RedirectState {
            provider,
            https_port,
        })
}

async fn challenge_response(
    State(state): State<RedirectState>,
    Path(token): Path<String>,
) -> Response {
    match state.provider.challenge_response(&token) {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => (StatusCode::NOT_FOUND, "no pending challenge").into_response(),
    }
}

async fn redirect_to_https(State(state): State<RedirectState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(http::host_without_port)
        .unwrap_or("localhost");

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = if state.https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, state.https_port, path)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, DomainRule, PortRange};

    fn base_config() -> ServerConfig {
        ServerConfig {
            domains: vec![DomainRule::new("example.com", "op")],
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_empty_domains() {
        let config = ServerConfig {
            domains: vec![],
            ..base_config()
        };
        assert!(matches!(
            Server::new(config),
            Err(ServerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_empty_port_range() {
        let config = ServerConfig {
            tunnel_port_range: PortRange { min: 200, max: 100 },
            ..base_config()
        };
        assert!(Server::new(config).is_err());
    }

    #[test]
    fn test_rejects_auth_without_tokens() {
        let config = ServerConfig {
            auth: AuthConfig {
                required: true,
                tokens: vec![],
            },
            ..base_config()
        };
        assert!(Server::new(config).is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port_is_learned() {
        let config = ServerConfig {
            host: "127.0.0.1".parse().unwrap(),
            ..base_config()
        };
        let running = Server::new(config).unwrap().bind().await.unwrap();

        assert_ne!(running.local_addr().port(), 0);
        assert_eq!(
            running.state().config.port,
            running.local_addr().port()
        );

        running.shutdown().await;
    }
}
