//! Agent core
//!
//! Owns the control channel: dial, authenticate, request the desired
//! tunnel set, terminate dispatched HTTP requests against the origin, relay
//! TCP sub-connections, and reconnect with exponential backoff. The desired
//! tunnel set is the source of truth; the server side is rebuilt from it on
//! every reconnect.

use crate::config::{reconnect_delay, AgentConfig, ConfigError, TunnelSlot};
use crate::origin;
use crate::tls::insecure_client_config;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use outpost_proto::{
    codec, encode_response_body, CodecError, Envelope, HeaderList, Message, TunnelSpec,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config, Connector};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial plus WebSocket handshake budget.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Application-level heartbeat interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Silence on the control channel after which the server is declared dead.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(45);

const OUTBOUND_QUEUE: usize = 256;
const CONN_QUEUE: usize = 64;
const READ_BUF: usize = 16 * 1024;

/// Agent lifecycle, for logging and health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Dialing,
    Authenticating,
    Running,
    Reconnecting,
    Closed,
}

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to dial server: {0}")]
    Dial(String),

    #[error("server handshake did not complete within {HANDSHAKE_TIMEOUT:?}")]
    HandshakeTimeout,

    #[error("server rejected authentication: {0}")]
    AuthRejected(String),
}

/// What the writer task puts on the wire.
enum Outbound {
    Msg(Message),
    Close,
}

/// Event delivered to one local TCP sub-connection.
enum ConnEvent {
    Data(Vec<u8>),
    Close,
}

enum SessionEnd {
    Disconnected,
    ShuttingDown,
}

/// The tunnel agent.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run until a fatal error. Reconnects per configuration.
    pub async fn run(self) -> Result<(), AgentError> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run_until(shutdown_rx).await
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    pub async fn run_until(self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        crate::tls::install_crypto_provider();
        let mut attempt: u32 = 0;

        loop {
            let mut authenticated = false;
            match self.run_session(&mut shutdown, &mut authenticated).await {
                Ok(SessionEnd::ShuttingDown) => {
                    info!("agent shut down");
                    return Ok(());
                }
                Ok(SessionEnd::Disconnected) => {
                    debug!("control channel disconnected");
                }
                Err(AgentError::AuthRejected(reason)) => {
                    return Err(AgentError::AuthRejected(reason));
                }
                Err(e) => warn!("session failed: {}", e),
            }

            if !self.config.reconnect {
                return Ok(());
            }
            if authenticated {
                attempt = 0;
            }
            attempt += 1;

            let delay = reconnect_delay(attempt);
            info!(attempt, "reconnecting in {:?}", delay);
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn dial(&self) -> Result<WsStream, AgentError> {
        let url = self.config.control_url()?;
        info!(%url, "dialing server");

        let connect = async {
            if url.scheme() == "wss" && !self.config.reject_unauthorized {
                let connector = Connector::Rustls(insecure_client_config());
                connect_async_tls_with_config(url.as_str(), None, false, Some(connector)).await
            } else {
                connect_async(url.as_str()).await
            }
        };

        let (stream, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect)
            .await
            .map_err(|_| AgentError::HandshakeTimeout)?
            .map_err(|e| AgentError::Dial(e.to_string()))?;

        Ok(stream)
    }

    /// One dial-to-disconnect cycle.
    async fn run_session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        authenticated: &mut bool,
    ) -> Result<SessionEnd, AgentError> {
        let stream = self.dial().await?;
        let (sink, stream) = stream.split();

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(sink, out_rx));

        let mut session = ActiveSession {
            config: &self.config,
            out_tx: out_tx.clone(),
            tunnels: HashMap::new(),
            pending_tunnels: VecDeque::new(),
            conns: Arc::new(DashMap::new()),
        };

        if let Some(token) = &self.config.token {
            debug!("authenticating");
            let _ = out_tx
                .send(Outbound::Msg(Message::Auth {
                    token: Some(token.clone()),
                }))
                .await;
        }

        let result = self
            .session_loop(&mut session, stream, shutdown, authenticated)
            .await;

        // dropping the event senders tears the sub-connection tasks down
        session.conns.clear();
        writer.abort();

        result
    }

    async fn session_loop(
        &self,
        session: &mut ActiveSession<'_>,
        mut stream: SplitStream<WsStream>,
        shutdown: &mut watch::Receiver<bool>,
        authenticated: &mut bool,
    ) -> Result<SessionEnd, AgentError> {
        let mut ping_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = session.out_tx.send(Outbound::Close).await;
                    return Ok(SessionEnd::ShuttingDown);
                }
                _ = ping_interval.tick() => {
                    if last_activity.elapsed() > LIVENESS_TIMEOUT {
                        warn!("no liveness signal for {:?}, dropping channel", LIVENESS_TIMEOUT);
                        return Ok(SessionEnd::Disconnected);
                    }
                    if session.out_tx.send(Outbound::Msg(Message::Ping)).await.is_err() {
                        return Ok(SessionEnd::Disconnected);
                    }
                }
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!("control channel error: {}", e);
                            return Ok(SessionEnd::Disconnected);
                        }
                        None => return Ok(SessionEnd::Disconnected),
                    };
                    last_activity = Instant::now();

                    match frame {
                        WsMessage::Text(text) => {
                            let envelope = match codec::decode(&text) {
                                Ok(envelope) => envelope,
                                Err(CodecError::UnknownType { type_name }) => {
                                    warn!(%type_name, "ignoring unknown message type");
                                    continue;
                                }
                                Err(e) => {
                                    warn!("discarding malformed frame: {}", e);
                                    continue;
                                }
                            };
                            session.handle(envelope, authenticated).await?;
                        }
                        WsMessage::Close(_) => return Ok(SessionEnd::Disconnected),
                        // tungstenite answers pings internally
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Mutable state for one connected session.
struct ActiveSession<'a> {
    config: &'a AgentConfig,
    out_tx: mpsc::Sender<Outbound>,
    /// server tunnel id -> desired slot
    tunnels: HashMap<String, TunnelSlot>,
    /// tunnel requests awaiting their response, in send order; frames on
    /// the channel are ordered, so responses pop front
    pending_tunnels: VecDeque<String>,
    /// live TCP sub-connections by connection id
    conns: Arc<DashMap<String, mpsc::Sender<ConnEvent>>>,
}

impl ActiveSession<'_> {
    async fn send(&self, message: Message) -> bool {
        self.out_tx.send(Outbound::Msg(message)).await.is_ok()
    }

    async fn handle(
        &mut self,
        envelope: Envelope,
        authenticated: &mut bool,
    ) -> Result<(), AgentError> {
        match envelope.message {
            Message::AuthResponse {
                success,
                client_id,
                error,
            } => {
                if !success {
                    return Err(AgentError::AuthRejected(
                        error.unwrap_or_else(|| "no reason given".to_string()),
                    ));
                }
                if *authenticated {
                    return Ok(());
                }
                *authenticated = true;
                info!(client_id = ?client_id, "authenticated, requesting tunnels");
                self.request_tunnels().await;
            }
            Message::TunnelResponse {
                success,
                tunnel_id,
                public_url,
                error,
            } => {
                self.handle_tunnel_response(success, tunnel_id, public_url, error);
            }
            Message::HttpRequest {
                tunnel_id,
                request_id,
                method,
                path,
                headers,
                body,
            } => {
                self.handle_http_request(tunnel_id, request_id, method, path, headers, body);
            }
            Message::TcpData {
                tunnel_id,
                connection_id,
                data,
            } => {
                self.handle_tcp_data(tunnel_id, connection_id, data).await;
            }
            Message::TcpClose {
                tunnel_id: _,
                connection_id,
            } => {
                if let Some((_, events)) = self.conns.remove(&connection_id) {
                    let _ = events.send(ConnEvent::Close).await;
                }
            }
            Message::Ping => {
                self.send(Message::Pong).await;
            }
            Message::Pong => {}
            Message::Error { error, code } => {
                warn!(?code, "server reported error: {}", error);
            }
            other => {
                trace!(
                    type_name = other.type_name(),
                    "ignoring agent-bound frame of the wrong direction"
                );
            }
        }
        Ok(())
    }

    /// Re-issue a `tunnel_request` for every autostart slot.
    async fn request_tunnels(&mut self) {
        for slot in self.config.tunnels.iter().filter(|slot| slot.autostart) {
            let spec: TunnelSpec = slot.to_spec();
            self.pending_tunnels.push_back(slot.name.clone());
            if !self.send(Message::TunnelRequest { config: spec }).await {
                return;
            }
        }
    }

    fn handle_tunnel_response(
        &mut self,
        success: bool,
        tunnel_id: Option<String>,
        public_url: Option<String>,
        error: Option<String>,
    ) {
        let name = match self.pending_tunnels.pop_front() {
            Some(name) => name,
            None => {
                warn!("tunnel response without a pending request");
                return;
            }
        };

        if !success {
            warn!(
                tunnel = %name,
                "tunnel request rejected: {}",
                error.unwrap_or_else(|| "no reason given".to_string())
            );
            return;
        }

        let slot = self
            .config
            .tunnels
            .iter()
            .find(|slot| slot.name == name)
            .cloned();
        match (tunnel_id, slot) {
            (Some(tunnel_id), Some(slot)) => {
                info!(
                    tunnel = %name,
                    url = public_url.as_deref().unwrap_or("-"),
                    "tunnel established"
                );
                self.tunnels.insert(tunnel_id, slot);
            }
            _ => warn!(tunnel = %name, "tunnel response missing id"),
        }
    }

    fn handle_http_request(
        &self,
        tunnel_id: String,
        request_id: String,
        method: String,
        path: String,
        headers: HeaderList,
        body: Option<Vec<u8>>,
    ) {
        let out_tx = self.out_tx.clone();
        let slot = self.tunnels.get(&tunnel_id).cloned();

        tokio::spawn(async move {
            let response = match slot {
                Some(slot) => {
                    respond_from_origin(&slot, &method, &path, &headers, body).await
                }
                None => error_json(502, "unknown tunnel"),
            };

            let (status_code, response_headers, response_body) = response;
            let _ = out_tx
                .send(Outbound::Msg(Message::HttpResponse {
                    tunnel_id,
                    request_id,
                    status_code,
                    headers: response_headers,
                    body: if response_body.is_empty() {
                        None
                    } else {
                        Some(encode_response_body(&response_body))
                    },
                    is_base64: true,
                }))
                .await;
        });
    }

    /// First `tcp_data` for an unknown connection id opens the origin
    /// socket; later frames write to it.
    async fn handle_tcp_data(&mut self, tunnel_id: String, connection_id: String, data: Vec<u8>) {
        if let Some(events) = self.conns.get(&connection_id).map(|e| e.value().clone()) {
            let _ = events.send(ConnEvent::Data(data)).await;
            return;
        }

        let slot = match self.tunnels.get(&tunnel_id) {
            Some(slot) => slot.clone(),
            None => {
                trace!(%connection_id, "tcp data for unknown tunnel");
                self.send(Message::TcpClose {
                    tunnel_id,
                    connection_id,
                })
                .await;
                return;
            }
        };

        let (events_tx, events_rx) = mpsc::channel(CONN_QUEUE);
        let _ = events_tx.send(ConnEvent::Data(data)).await;
        self.conns.insert(connection_id.clone(), events_tx);

        tokio::spawn(run_tcp_conn(
            slot,
            tunnel_id,
            connection_id,
            events_rx,
            self.out_tx.clone(),
            self.conns.clone(),
        ));
    }
}

/// Drain the outbound queue onto the socket.
async fn write_loop(mut sink: SplitSink<WsStream, WsMessage>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Msg(message) => {
                let envelope = Envelope::new(message);
                let text = match codec::encode(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
}

/// Fetch from the origin and shape the `(status, headers, body)` triple,
/// including the two 502 flavors.
async fn respond_from_origin(
    slot: &TunnelSlot,
    method: &str,
    path: &str,
    headers: &HeaderList,
    body: Option<Vec<u8>>,
) -> (u16, HeaderList, Vec<u8>) {
    match origin::fetch(slot, method, path, headers, body).await {
        Ok(response) => (response.status, response.headers, response.body),
        Err(e) if e.is_unreachable() => {
            debug!(address = %slot.local_address(), "origin unreachable");
            (
                502,
                vec![(
                    "Content-Type".to_string(),
                    "text/html; charset=utf-8".to_string(),
                )],
                origin::no_app_running_page(&slot.local_address()).into_bytes(),
            )
        }
        Err(e) => {
            warn!(address = %slot.local_address(), "origin error: {}", e);
            error_json(502, &e.to_string())
        }
    }
}

fn error_json(status: u16, message: &str) -> (u16, HeaderList, Vec<u8>) {
    let body = serde_json::json!({ "error": message }).to_string();
    (
        status,
        vec![(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )],
        body.into_bytes(),
    )
}

/// One TCP sub-connection: origin socket wired to the control channel in
/// both directions.
async fn run_tcp_conn(
    slot: TunnelSlot,
    tunnel_id: String,
    connection_id: String,
    mut events_rx: mpsc::Receiver<ConnEvent>,
    out_tx: mpsc::Sender<Outbound>,
    conns: Arc<DashMap<String, mpsc::Sender<ConnEvent>>>,
) {
    let stream = match origin::connect(&slot).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(address = %slot.local_address(), "tcp origin connect failed: {}", e);
            conns.remove(&connection_id);
            let _ = out_tx
                .send(Outbound::Msg(Message::TcpClose {
                    tunnel_id,
                    connection_id,
                }))
                .await;
            return;
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    let reader = tokio::spawn(tcp_read_loop(
        read_half,
        tunnel_id.clone(),
        connection_id.clone(),
        out_tx.clone(),
        conns.clone(),
    ));

    let mut peer_closed = false;
    while let Some(event) = events_rx.recv().await {
        match event {
            ConnEvent::Data(data) => {
                if tokio::io::AsyncWriteExt::write_all(&mut write_half, &data)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ConnEvent::Close => {
                peer_closed = true;
                break;
            }
        }
    }

    let _ = tokio::io::AsyncWriteExt::shutdown(&mut write_half).await;
    if peer_closed {
        // the public side is gone; drop the origin read side too
        reader.abort();
    } else {
        let _ = reader.await;
    }
    conns.remove(&connection_id);
}

/// Pump origin bytes into `tcp_data` frames until EOF.
async fn tcp_read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    tunnel_id: String,
    connection_id: String,
    out_tx: mpsc::Sender<Outbound>,
    conns: Arc<DashMap<String, mpsc::Sender<ConnEvent>>>,
) {
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; READ_BUF];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let sent = out_tx
                    .send(Outbound::Msg(Message::TcpData {
                        tunnel_id: tunnel_id.clone(),
                        connection_id: connection_id.clone(),
                        data: buf[..n].to_vec(),
                    }))
                    .await;
                if sent.is_err() {
                    return;
                }
            }
        }
    }

    conns.remove(&connection_id);
    let _ = out_tx
        .send(Outbound::Msg(Message::TcpClose {
            tunnel_id,
            connection_id,
        }))
        .await;
}
