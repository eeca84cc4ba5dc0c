//! Public HTTP dispatcher
//!
//! Routes every non-control request on the public listener: the apex serves
//! the built-in status API, anything under a registered subdomain is
//! forwarded through the owning agent session, everything else is a JSON
//! 404. Forwarded requests are correlated with their `http_response` by
//! request id, bounded by the configured round-trip timeout.

use crate::config::DomainRule;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use outpost_proto::{decode_response_body, Decision, HeaderList, Message};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Hop-by-hop headers never copied across the tunnel boundary.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("proxy-")
}

/// Where a Host header landed.
#[derive(Debug, PartialEq)]
pub enum HostMatch<'a> {
    /// Built-in status/API surface
    Apex(&'a DomainRule),
    /// A tunnel candidate; the subdomain is everything before the suffix
    Tunnel {
        rule: &'a DomainRule,
        subdomain: String,
    },
}

/// Strip an optional port from a Host header value.
pub fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // bracketed IPv6 literal
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

/// Match a hostname against the ordered domain rules; first match wins.
pub fn match_host<'a>(rules: &'a [DomainRule], host: &str) -> Option<HostMatch<'a>> {
    let host = host_without_port(host).to_ascii_lowercase();

    for rule in rules {
        if host == rule.domain || host == rule.apex() {
            return Some(HostMatch::Apex(rule));
        }
        if let Some(prefix) = host.strip_suffix(&rule.tunnel_suffix()) {
            if !prefix.is_empty() {
                return Some(HostMatch::Tunnel {
                    rule,
                    subdomain: prefix.to_string(),
                });
            }
        }
    }
    None
}

/// Client IP with proxy-header precedence:
/// `CF-Connecting-IP`, then `X-Real-IP`, then the first `X-Forwarded-For`
/// entry, then the peer socket, then `"unknown"`.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    for name in ["cf-connecting-ip", "x-real-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
    (status, axum::Json(value)).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    json_response(status, json!({ "error": message }))
}

/// Catch-all handler for the public listener.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let host = match req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        Some(host) => host.to_string(),
        None => return error_response(StatusCode::BAD_REQUEST, "missing Host header"),
    };

    let subdomain = match match_host(&state.config.domains, &host) {
        Some(HostMatch::Apex(_)) => return apex(&state, &req),
        Some(HostMatch::Tunnel { subdomain, .. }) => subdomain,
        None => {
            trace!(%host, "request for unrecognized host");
            return error_response(StatusCode::NOT_FOUND, "unknown host");
        }
    };

    forward(state, peer, host, subdomain, req).await
}

/// Built-in endpoints on the bare domain / basePath apex.
fn apex(state: &Arc<AppState>, req: &Request) -> Response {
    if req.method() != Method::GET {
        return error_response(StatusCode::NOT_FOUND, "not found");
    }

    match req.uri().path() {
        "/" => {
            let rule = state.config.primary_domain();
            json_response(
                StatusCode::OK,
                json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "status": "ok",
                    "domain": rule.domain,
                    "subdomainPattern": format!("{{subdomain}}{}", rule.tunnel_suffix()),
                    "clients": state.sessions.len(),
                    "tunnels": state.registry.len(),
                }),
            )
        }
        "/api/stats" => json_response(
            StatusCode::OK,
            json!({
                "clients": state.sessions.len(),
                "tunnels": state.registry.len(),
                "uptime": state.started_at.elapsed().as_secs(),
            }),
        ),
        "/api/tunnels" => {
            let tunnels: Vec<serde_json::Value> = state
                .registry
                .snapshot()
                .iter()
                .map(|t| {
                    json!({
                        "id": t.id,
                        "protocol": t.protocol.as_str(),
                        "localAddress": t.local_address(),
                        "publicUrl": t.public_url,
                        "createdAt": t.created_at.to_rfc3339(),
                        "bytesIn": t.stats.bytes_in(),
                        "bytesOut": t.stats.bytes_out(),
                        "connections": t.stats.connections(),
                    })
                })
                .collect();
            json_response(StatusCode::OK, json!({ "tunnels": tunnels }))
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Forward one public request through the owning agent session.
async fn forward(
    state: Arc<AppState>,
    peer: SocketAddr,
    host: String,
    subdomain: String,
    req: Request,
) -> Response {
    let ip = client_ip(req.headers(), Some(peer.ip()));

    if let Decision::Denied(reason) = state.ip_policy.check_str(&ip) {
        debug!(%ip, %reason, "public request denied by IP policy");
        return json_response(
            StatusCode::FORBIDDEN,
            json!({ "error": "Access denied", "reason": reason }),
        );
    }

    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if let crate::fraud::Verdict::Deny(reason) = state.fraud.verify(&ip, user_agent).await {
        debug!(%ip, %reason, "public request denied by fraud predicate");
        return json_response(
            StatusCode::FORBIDDEN,
            json!({ "error": "Access denied", "reason": reason }),
        );
    }

    let tunnel = match state.registry.lookup_subdomain(&subdomain) {
        Some(tunnel) => tunnel,
        None => {
            return json_response(
                StatusCode::NOT_FOUND,
                json!({ "error": "tunnel not found", "subdomain": subdomain }),
            );
        }
    };

    let session = match state.sessions.get(&tunnel.session_id) {
        Some(session) => session,
        None => {
            // registry entry outlived its session; repair and fail the request
            state.registry.remove(&tunnel.id);
            return error_response(StatusCode::BAD_GATEWAY, "tunnel connection lost");
        }
    };

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let headers = forward_headers(
        &parts.headers,
        &host,
        state.config.public_scheme(),
        &ip,
    );
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let request_id = uuid::Uuid::new_v4().to_string();
    let receiver = session.pending.register(&request_id);

    tunnel.stats.add_connection();
    tunnel.stats.add_bytes_in(body.len() as u64);

    let sent = session
        .send(Message::HttpRequest {
            tunnel_id: tunnel.id.clone(),
            request_id: request_id.clone(),
            method: parts.method.as_str().to_string(),
            path,
            headers,
            body: if body.is_empty() {
                None
            } else {
                Some(body.to_vec())
            },
        })
        .await;
    if !sent {
        session.pending.forget(&request_id);
        return error_response(StatusCode::BAD_GATEWAY, "tunnel connection lost");
    }

    match tokio::time::timeout(state.config.request_timeout, receiver).await {
        Ok(Ok(agent_response)) => {
            build_public_response(agent_response, state.config.max_body_bytes)
        }
        Ok(Err(_)) => error_response(StatusCode::BAD_GATEWAY, "tunnel connection lost"),
        Err(_) => {
            session.pending.forget(&request_id);
            warn!(tunnel_id = %tunnel.id, %request_id, "tunnel response timed out");
            error_response(StatusCode::BAD_GATEWAY, "tunnel did not respond in time")
        }
    }
}

/// Copy request headers for the agent, dropping hop-by-hop entries and
/// stamping the forwarding trio.
fn forward_headers(
    headers: &HeaderMap,
    original_host: &str,
    scheme: &str,
    client_ip: &str,
) -> HeaderList {
    let mut out: HeaderList = Vec::with_capacity(headers.len() + 3);
    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop(name) {
            continue;
        }
        // the forwarding trio is stamped below; client-supplied values are
        // folded in (X-Forwarded-For) or replaced (the other two)
        if name.eq_ignore_ascii_case("x-forwarded-for")
            || name.eq_ignore_ascii_case("x-forwarded-host")
            || name.eq_ignore_ascii_case("x-forwarded-proto")
        {
            continue;
        }
        out.push((
            name.to_string(),
            String::from_utf8_lossy(value.as_bytes()).to_string(),
        ));
    }

    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => {
            format!("{}, {}", existing.trim(), client_ip)
        }
        _ => client_ip.to_string(),
    };

    out.push(("X-Forwarded-Host".to_string(), original_host.to_string()));
    out.push(("X-Forwarded-Proto".to_string(), scheme.to_string()));
    out.push(("X-Forwarded-For".to_string(), forwarded_for));
    out
}

/// Turn the agent's response frame into the public response.
fn build_public_response(
    agent_response: crate::correlator::AgentResponse,
    max_body_bytes: usize,
) -> Response {
    let status = match StatusCode::from_u16(agent_response.status_code) {
        Ok(status) => status,
        Err(_) => {
            return error_response(StatusCode::BAD_GATEWAY, "tunnel returned an invalid status");
        }
    };

    let body = match decode_response_body(agent_response.body.as_deref(), agent_response.is_base64)
    {
        Ok(body) => body.unwrap_or_default(),
        Err(_) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                "tunnel returned an invalid body encoding",
            );
        }
    };
    if body.len() > max_body_bytes {
        return error_response(StatusCode::BAD_GATEWAY, "tunnel response too large");
    }

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &agent_response.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "dropping invalid response header"),
            }
        }
    }

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "invalid tunnel response"))
}
