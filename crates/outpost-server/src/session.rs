//! Agent sessions
//!
//! Per-control-channel state machine on the server. Each WebSocket upgrade
//! on `/_tunnel` becomes an [`AgentSession`]: authentication, tunnel
//! lifecycle, request dispatch, and liveness all run against it. A session
//! owns its tunnels; when the channel goes away the tunnels, pending
//! requests, and public TCP connections attached to it go with it.

use crate::correlator::{AgentResponse, PendingRequests};
use crate::server::AppState;
use crate::tcp;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use outpost_proto::{codec, CodecError, Envelope, Message, TunnelProtocol, TunnelSpec};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Application-level heartbeat interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Silence on the control channel after which the peer is declared dead.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(45);

/// Grace period for the auth exchange after the channel opens.
pub const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Outbound capacity; a full queue back-pressures TCP relays.
const OUTBOUND_QUEUE: usize = 256;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    Serving,
    Closing,
    Closed,
}

/// What the writer task puts on the wire.
#[derive(Debug)]
pub enum Outbound {
    Frame(Envelope),
    Close { code: u16, reason: String },
}

/// Handle to one public TCP sub-connection attached to a session.
pub struct TcpConnHandle {
    pub tunnel_id: String,
    pub events: mpsc::Sender<tcp::ConnEvent>,
}

/// Per-control-channel context.
pub struct AgentSession {
    pub id: String,
    pub peer_ip: String,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<Outbound>,
    pub pending: PendingRequests,
    tcp_conns: DashMap<String, TcpConnHandle>,
    owned_tunnels: Mutex<HashSet<String>>,
    listener_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    last_activity: Mutex<Instant>,
    created_at: Instant,
    closing: watch::Sender<bool>,
}

impl AgentSession {
    pub fn new(peer_ip: String) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closing, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_ip,
            state: Mutex::new(SessionState::Connected),
            outbound: tx,
            pending: PendingRequests::new(),
            tcp_conns: DashMap::new(),
            owned_tunnels: Mutex::new(HashSet::new()),
            listener_tasks: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            created_at: Instant::now(),
            closing,
        });
        (session, rx)
    }

    /// Receiver that fires once the session starts closing.
    pub fn closing_signal(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    pub fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("session state lock poisoned") = next;
    }

    pub fn is_serving(&self) -> bool {
        self.state() == SessionState::Serving
    }

    /// Queue a frame for the peer. Awaits when the channel is saturated,
    /// which is what back-pressures TCP relays.
    pub async fn send(&self, message: Message) -> bool {
        self.outbound
            .send(Outbound::Frame(Envelope::new(message)))
            .await
            .is_ok()
    }

    /// Ask the writer to close the channel. Later calls are no-ops.
    pub async fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.state.lock().expect("session state lock poisoned");
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        let _ = self
            .outbound
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
        let _ = self.closing.send(true);
    }

    /// Note inbound traffic for liveness.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("activity lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn adopt_tunnel(&self, tunnel_id: &str) {
        self.owned_tunnels
            .lock()
            .expect("tunnel set lock poisoned")
            .insert(tunnel_id.to_string());
    }

    pub fn owns_tunnel(&self, tunnel_id: &str) -> bool {
        self.owned_tunnels
            .lock()
            .expect("tunnel set lock poisoned")
            .contains(tunnel_id)
    }

    pub fn disown_tunnel(&self, tunnel_id: &str) {
        self.owned_tunnels
            .lock()
            .expect("tunnel set lock poisoned")
            .remove(tunnel_id);
    }

    pub fn owned_tunnels(&self) -> Vec<String> {
        self.owned_tunnels
            .lock()
            .expect("tunnel set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Track the per-tunnel TCP listener task so teardown can abort it.
    pub fn track_listener(&self, tunnel_id: &str, handle: JoinHandle<()>) {
        let mut tasks = self
            .listener_tasks
            .lock()
            .expect("listener task lock poisoned");
        if let Some(old) = tasks.insert(tunnel_id.to_string(), handle) {
            old.abort();
        }
    }

    pub fn abort_listener(&self, tunnel_id: &str) {
        if let Some(handle) = self
            .listener_tasks
            .lock()
            .expect("listener task lock poisoned")
            .remove(tunnel_id)
        {
            handle.abort();
        }
    }

    pub fn register_conn(&self, connection_id: &str, handle: TcpConnHandle) {
        self.tcp_conns.insert(connection_id.to_string(), handle);
    }

    pub fn remove_conn(&self, connection_id: &str) {
        self.tcp_conns.remove(connection_id);
    }

    /// Deliver an event to a public TCP connection. Unknown ids and
    /// tunnel-id mismatches are dropped silently per the protocol contract.
    pub async fn conn_event(&self, tunnel_id: &str, connection_id: &str, event: tcp::ConnEvent) {
        let events = match self.tcp_conns.get(connection_id) {
            Some(conn) if conn.tunnel_id == tunnel_id => conn.events.clone(),
            Some(_) => {
                trace!(connection_id, "tcp frame with mismatched tunnel id");
                return;
            }
            None => {
                trace!(connection_id, "tcp frame for unknown connection");
                return;
            }
        };
        let _ = events.send(event).await;
    }

    /// Close every public TCP connection attached to `tunnel_id`.
    pub async fn close_conns_for_tunnel(&self, tunnel_id: &str) {
        let ids: Vec<String> = self
            .tcp_conns
            .iter()
            .filter(|entry| entry.value().tunnel_id == tunnel_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, conn)) = self.tcp_conns.remove(&id) {
                let _ = conn.events.send(tcp::ConnEvent::Close).await;
            }
        }
    }

    async fn close_all_conns(&self) {
        let ids: Vec<String> = self.tcp_conns.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, conn)) = self.tcp_conns.remove(&id) {
                let _ = conn.events.send(tcp::ConnEvent::Close).await;
            }
        }
    }
}

/// Live sessions, keyed by session id.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<AgentSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<AgentSession>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// `GET /_tunnel` upgrade endpoint.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let client_ip = crate::http::client_ip(&headers, Some(peer.ip()));
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    ws.on_upgrade(move |socket| handle_socket(socket, state, client_ip, user_agent))
}

/// Full lifecycle of one control channel.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    client_ip: String,
    user_agent: String,
) {
    let (session, outbound_rx) = AgentSession::new(client_ip.clone());
    info!(session_id = %session.id, peer = %client_ip, "control channel opened");

    let (ws_sink, mut ws_stream) = socket.split();
    let writer = tokio::spawn(write_loop(ws_sink, outbound_rx));

    // Access control runs before anything else on the channel.
    let decision = state.ip_policy.check_str(&client_ip);
    if let outpost_proto::Decision::Denied(reason) = decision {
        warn!(peer = %client_ip, %reason, "control channel denied by IP policy");
        session.close(close_code::POLICY, "access denied").await;
        let _ = writer.await;
        return;
    }
    if let crate::fraud::Verdict::Deny(reason) = state.fraud.verify(&client_ip, &user_agent).await {
        warn!(peer = %client_ip, %reason, "control channel denied by fraud predicate");
        session.close(close_code::POLICY, "access denied").await;
        let _ = writer.await;
        return;
    }

    if !state.config.auth.required {
        session.set_state(SessionState::Serving);
        state.sessions.insert(session.clone());
        session
            .send(Message::AuthResponse {
                success: true,
                client_id: Some(session.id.clone()),
                error: None,
            })
            .await;
    }

    let liveness = tokio::spawn(liveness_loop(session.clone()));
    let mut closing = session.closing_signal();

    loop {
        let frame = tokio::select! {
            // a close decided elsewhere (liveness, policy, shutdown) must
            // not wait on a peer that has gone silent
            _ = closing.changed() => break,
            frame = ws_stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(session_id = %session.id, "control channel error: {}", e);
                break;
            }
            None => break,
        };
        session.touch();

        match frame {
            WsMessage::Text(text) => {
                let envelope = match codec::decode(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(CodecError::UnknownType { type_name }) => {
                        warn!(session_id = %session.id, %type_name, "ignoring unknown message type");
                        continue;
                    }
                    Err(e) => {
                        warn!(session_id = %session.id, "discarding malformed frame: {}", e);
                        continue;
                    }
                };
                handle_message(&state, &session, envelope.message).await;
            }
            WsMessage::Close(_) => break,
            // tungstenite answers native pings on its own; both directions
            // already refreshed liveness above
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => {}
        }

        if matches!(
            session.state(),
            SessionState::Closing | SessionState::Closed
        ) {
            break;
        }
    }

    liveness.abort();
    cleanup(&state, &session).await;
    let _ = writer.await;
    info!(session_id = %session.id, "control channel closed");
}

/// Drain the outbound queue onto the socket.
async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(envelope) => {
                let text = match codec::encode(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Heartbeat plus dead-peer detection.
async fn liveness_loop(session: Arc<AgentSession>) {
    const CHECK_INTERVAL: Duration = Duration::from_secs(5);

    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + CHECK_INTERVAL,
        CHECK_INTERVAL,
    );
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_ping = Instant::now();

    loop {
        interval.tick().await;

        if session.idle_for() > LIVENESS_TIMEOUT {
            warn!(session_id = %session.id, "no liveness signal for {:?}, closing", LIVENESS_TIMEOUT);
            session.close(close_code::NORMAL, "liveness timeout").await;
            return;
        }
        if !session.is_serving() && session.age() > AUTH_DEADLINE {
            warn!(session_id = %session.id, "authentication deadline expired");
            session.close(close_code::POLICY, "authentication timeout").await;
            return;
        }
        if last_ping.elapsed() >= PING_INTERVAL {
            if !session.send(Message::Ping).await {
                return;
            }
            last_ping = Instant::now();
        }
    }
}

async fn handle_message(state: &Arc<AppState>, session: &Arc<AgentSession>, message: Message) {
    match session.state() {
        SessionState::Connected => handle_pre_auth(state, session, message).await,
        SessionState::Authenticated | SessionState::Serving => {
            handle_serving(state, session, message).await
        }
        SessionState::Closing | SessionState::Closed => {}
    }
}

/// In `Connected` the only acceptable frame is `auth`.
async fn handle_pre_auth(state: &Arc<AppState>, session: &Arc<AgentSession>, message: Message) {
    let token = match message {
        Message::Auth { token } => token,
        other => {
            warn!(
                session_id = %session.id,
                type_name = other.type_name(),
                "message before authentication"
            );
            session
                .close(close_code::POLICY, "authentication required")
                .await;
            return;
        }
    };

    if token_matches(token.as_deref(), &state.config.auth.tokens) {
        session.set_state(SessionState::Serving);
        state.sessions.insert(session.clone());
        info!(session_id = %session.id, "agent authenticated");
        session
            .send(Message::AuthResponse {
                success: true,
                client_id: Some(session.id.clone()),
                error: None,
            })
            .await;
    } else {
        warn!(session_id = %session.id, "authentication failed");
        session
            .send(Message::AuthResponse {
                success: false,
                client_id: None,
                error: Some("invalid token".to_string()),
            })
            .await;
        session
            .close(close_code::POLICY, "authentication failed")
            .await;
    }
}

/// Compare SHA-256 digests so the comparison cost does not depend on where
/// the token text diverges.
fn token_matches(supplied: Option<&str>, configured: &[String]) -> bool {
    let supplied = match supplied {
        Some(token) => token,
        None => return false,
    };
    let supplied_digest = Sha256::digest(supplied.as_bytes());
    configured
        .iter()
        .any(|token| Sha256::digest(token.as_bytes()) == supplied_digest)
}

async fn handle_serving(state: &Arc<AppState>, session: &Arc<AgentSession>, message: Message) {
    match message {
        Message::TunnelRequest { config } => {
            handle_tunnel_request(state, session, config).await;
        }
        Message::TunnelClose { tunnel_id } => {
            if session.owns_tunnel(&tunnel_id) {
                teardown_tunnel(state, session, &tunnel_id).await;
            } else {
                debug!(session_id = %session.id, %tunnel_id, "close for tunnel not owned here");
            }
        }
        Message::HttpResponse {
            tunnel_id,
            request_id,
            status_code,
            headers,
            body,
            is_base64,
        } => {
            if let Some(tunnel) = state.registry.get(&tunnel_id) {
                if let Some(body) = &body {
                    tunnel.stats.add_bytes_out(body.len() as u64);
                }
            }
            session.pending.complete(
                &request_id,
                AgentResponse {
                    status_code,
                    headers,
                    body,
                    is_base64,
                },
            );
        }
        Message::TcpData {
            tunnel_id,
            connection_id,
            data,
        } => {
            session
                .conn_event(&tunnel_id, &connection_id, tcp::ConnEvent::Data(data))
                .await;
        }
        Message::TcpClose {
            tunnel_id,
            connection_id,
        } => {
            session
                .conn_event(&tunnel_id, &connection_id, tcp::ConnEvent::Close)
                .await;
            session.remove_conn(&connection_id);
        }
        Message::Ping => {
            session.send(Message::Pong).await;
        }
        Message::Pong => {}
        Message::Auth { .. } => {
            // idempotent re-auth from an already serving agent
            session
                .send(Message::AuthResponse {
                    success: true,
                    client_id: Some(session.id.clone()),
                    error: None,
                })
                .await;
        }
        Message::Error { error, code } => {
            warn!(session_id = %session.id, ?code, "agent reported error: {}", error);
        }
        other => {
            debug!(
                session_id = %session.id,
                type_name = other.type_name(),
                "ignoring server-bound frame of the wrong direction"
            );
        }
    }
}

async fn handle_tunnel_request(
    state: &Arc<AppState>,
    session: &Arc<AgentSession>,
    spec: TunnelSpec,
) {
    match create_tunnel(state, session, &spec).await {
        Ok(tunnel) => {
            info!(
                session_id = %session.id,
                tunnel_id = %tunnel.id,
                url = %tunnel.public_url,
                "tunnel created"
            );
            session
                .send(Message::TunnelResponse {
                    success: true,
                    tunnel_id: Some(tunnel.id.clone()),
                    public_url: Some(tunnel.public_url.clone()),
                    error: None,
                })
                .await;
        }
        Err(error) => {
            warn!(session_id = %session.id, name = %spec.id, "tunnel request failed: {}", error);
            session
                .send(Message::TunnelResponse {
                    success: false,
                    tunnel_id: None,
                    public_url: None,
                    error: Some(error),
                })
                .await;
        }
    }
}

async fn create_tunnel(
    state: &Arc<AppState>,
    session: &Arc<AgentSession>,
    spec: &TunnelSpec,
) -> Result<Arc<crate::registry::Tunnel>, String> {
    if spec.local_port == 0 {
        return Err("localPort must be non-zero".to_string());
    }
    if spec.local_host.is_empty() {
        return Err("localHost must not be empty".to_string());
    }

    match spec.protocol {
        TunnelProtocol::Http | TunnelProtocol::Https => {
            let rule = state.config.primary_domain().clone();
            let tunnel = state
                .registry
                .register_http(spec, &session.id, |subdomain| {
                    state.config.http_public_url(&rule, subdomain)
                })
                .map_err(|e| e.to_string())?;
            session.adopt_tunnel(&tunnel.id);

            // DNS record management happens off the dispatch path
            if let Some(public_ip) = state.config.public_ip {
                let dns = state.dns.clone();
                let fqdn = format!(
                    "{}{}",
                    tunnel.subdomain.as_deref().unwrap_or_default(),
                    rule.tunnel_suffix()
                );
                tokio::spawn(async move {
                    if let Err(e) = dns.upsert(&fqdn, public_ip).await {
                        warn!(%fqdn, "dns upsert failed: {}", e);
                    }
                });
            }

            Ok(tunnel)
        }
        TunnelProtocol::Tcp => {
            let tunnel = state
                .registry
                .register_tcp(spec, &session.id, state.config.tunnel_port_range, |port| {
                    state.config.tcp_public_url(port)
                })
                .map_err(|e| e.to_string())?;

            let port = tunnel.public_port.unwrap_or_default();
            let bind_addr = SocketAddr::new(state.config.host, port);
            let listener = match tokio::net::TcpListener::bind(bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    // roll the registration back so the port is reusable
                    state.registry.remove(&tunnel.id);
                    return Err(format!("failed to bind public port {}: {}", port, e));
                }
            };

            session.adopt_tunnel(&tunnel.id);
            let task = tokio::spawn(tcp::serve_tunnel(listener, tunnel.clone(), session.clone()));
            session.track_listener(&tunnel.id, task);

            Ok(tunnel)
        }
    }
}

/// Tear one tunnel down: listener, registry entry, DNS record, and any
/// public TCP connections riding on it.
pub async fn teardown_tunnel(state: &Arc<AppState>, session: &Arc<AgentSession>, tunnel_id: &str) {
    session.abort_listener(tunnel_id);
    session.close_conns_for_tunnel(tunnel_id).await;
    session.disown_tunnel(tunnel_id);

    if let Some(tunnel) = state.registry.remove(tunnel_id) {
        info!(session_id = %session.id, tunnel_id, "tunnel closed");
        if let (Some(subdomain), true) = (&tunnel.subdomain, state.config.public_ip.is_some()) {
            let dns = state.dns.clone();
            let fqdn = format!(
                "{}{}",
                subdomain,
                state.config.primary_domain().tunnel_suffix()
            );
            tokio::spawn(async move {
                if let Err(e) = dns.delete(&fqdn).await {
                    warn!(%fqdn, "dns delete failed: {}", e);
                }
            });
        }
    }
}

/// Channel-close teardown: every owned tunnel, pending request, and public
/// TCP connection attached to this session.
async fn cleanup(state: &Arc<AppState>, session: &Arc<AgentSession>) {
    // release the writer; a no-op when a close frame already went out
    session.close(close_code::NORMAL, "session closed").await;
    session.set_state(SessionState::Closed);
    state.sessions.remove(&session.id);

    for tunnel_id in session.owned_tunnels() {
        teardown_tunnel(state, session, &tunnel_id).await;
    }
    session.close_all_conns().await;
    // wakes every dispatcher still waiting on this session with an error,
    // which it reports as 502
    session.pending.abort_all();
}
