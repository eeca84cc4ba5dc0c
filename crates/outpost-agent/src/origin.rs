//! Local origin forwarding
//!
//! Terminates a dispatched `http_request` by opening a short-lived HTTP/1.1
//! connection to the configured local service. Connection-refused style
//! failures get the friendly "no app running" page; every other origin
//! error becomes a JSON 502.

use crate::config::TunnelSlot;
use crate::tls::insecure_client_config;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::Request;
use hyper_util::rt::TokioIo;
use outpost_proto::HeaderList;
use rustls::pki_types::ServerName;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Headers never forwarded between the tunnel and the origin.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// How long the agent waits on the origin before giving up. Kept under the
/// server's round-trip deadline so the public client sees our 502, not a
/// correlator timeout.
pub const ORIGIN_TIMEOUT: Duration = Duration::from_secs(25);

/// Largest origin response body the agent will relay.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Origin errors
#[derive(Debug, Error)]
pub enum OriginError {
    /// No service listening on the configured local address
    #[error("nothing is listening on {address}")]
    Unreachable { address: String },

    #[error("origin io error: {0}")]
    Io(#[from] io::Error),

    #[error("origin tls error: {0}")]
    Tls(String),

    #[error("origin http error: {0}")]
    Http(String),

    #[error("origin did not respond within {ORIGIN_TIMEOUT:?}")]
    Timeout,

    #[error("origin response exceeds {MAX_RESPONSE_BYTES} bytes")]
    TooLarge,
}

impl OriginError {
    /// Whether this failure should render the friendly HTML page.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, OriginError::Unreachable { .. })
    }
}

/// Status, headers, and body read back from the origin.
#[derive(Debug)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("proxy-")
}

/// Dial the origin, distinguishing "nothing is listening" from other IO
/// failures.
pub async fn connect(slot: &TunnelSlot) -> Result<TcpStream, OriginError> {
    let address = slot.local_address();
    TcpStream::connect((slot.local_host.as_str(), slot.local_port))
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable => OriginError::Unreachable { address },
            _ => OriginError::Io(e),
        })
}

/// Forward one request to the origin and collect the whole response.
pub async fn fetch(
    slot: &TunnelSlot,
    method: &str,
    path: &str,
    headers: &HeaderList,
    body: Option<Vec<u8>>,
) -> Result<OriginResponse, OriginError> {
    let stream = connect(slot).await?;
    trace!(address = %slot.local_address(), method, path, "forwarding to origin");

    if slot.origin_is_tls() {
        let server_name = ServerName::try_from(slot.local_host.clone())
            .map_err(|e| OriginError::Tls(format!("invalid origin host: {}", e)))?;
        let connector = tokio_rustls::TlsConnector::from(insecure_client_config());
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| OriginError::Tls(e.to_string()))?;
        exchange(slot, tls_stream, method, path, headers, body).await
    } else {
        exchange(slot, stream, method, path, headers, body).await
    }
}

async fn exchange<S>(
    slot: &TunnelSlot,
    stream: S,
    method: &str,
    path: &str,
    headers: &HeaderList,
    body: Option<Vec<u8>>,
) -> Result<OriginResponse, OriginError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| OriginError::Http(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("origin connection ended with error: {}", e);
        }
    });

    let mut builder = Request::builder().method(method).uri(path);
    if let Some(request_headers) = builder.headers_mut() {
        for (name, value) in headers {
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                hyper::header::HeaderName::from_bytes(name.as_bytes()),
                hyper::header::HeaderValue::from_str(value),
            ) {
                request_headers.append(name, value);
            }
        }
        if let Ok(host) = hyper::header::HeaderValue::from_str(&slot.local_address()) {
            request_headers.insert(hyper::header::HOST, host);
        }
    }

    let request = builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| OriginError::Http(e.to_string()))?;

    let response = tokio::time::timeout(ORIGIN_TIMEOUT, sender.send_request(request))
        .await
        .map_err(|_| OriginError::Timeout)?
        .map_err(|e| OriginError::Http(e.to_string()))?;

    let status = response.status().as_u16();
    let response_headers: HeaderList = response
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();

    let body = tokio::time::timeout(
        ORIGIN_TIMEOUT,
        Limited::new(response.into_body(), MAX_RESPONSE_BYTES).collect(),
    )
    .await
    .map_err(|_| OriginError::Timeout)?
    .map_err(|e| {
        if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
            OriginError::TooLarge
        } else {
            OriginError::Http(e.to_string())
        }
    })?
    .to_bytes()
    .to_vec();

    Ok(OriginResponse {
        status,
        headers: response_headers,
        body,
    })
}

/// Friendly page shown when the tunnel works but nothing listens locally.
pub fn no_app_running_page(local_address: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>No app running</title>
  <style>
    body {{ font-family: system-ui, sans-serif; background: #f6f6f6; color: #333;
           display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
    .card {{ background: #fff; border-radius: 8px; padding: 2rem 3rem; box-shadow: 0 2px 8px rgba(0,0,0,.08); }}
    code {{ background: #eee; padding: .15rem .4rem; border-radius: 4px; }}
  </style>
</head>
<body>
  <div class="card">
    <h1>Tunnel is up, app is not</h1>
    <p>The tunnel reached this agent, but nothing is listening on <code>{local_address}</code>.</p>
    <p>Start your app and refresh this page.</p>
  </div>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_proto::TunnelProtocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn slot(port: u16) -> TunnelSlot {
        TunnelSlot {
            name: "web".to_string(),
            protocol: TunnelProtocol::Http,
            local_host: "127.0.0.1".to_string(),
            local_port: port,
            subdomain: None,
            remote_port: None,
            autostart: true,
        }
    }

    /// One-shot HTTP/1.1 origin that records the request it saw.
    async fn spawn_origin(
        response: &'static str,
    ) -> (u16, tokio::sync::oneshot::Receiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        (port, rx)
    }

    #[tokio::test]
    async fn test_fetch_roundtrip() {
        let (port, seen) = spawn_origin(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\n\r\n{\"ok\":true}",
        )
        .await;

        let response = fetch(
            &slot(port),
            "GET",
            "/hello?x=1",
            &vec![
                ("Accept".to_string(), "*/*".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
                ("X-Forwarded-Host".to_string(), "web.op.example.com".to_string()),
            ],
            None,
        )
        .await
        .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"{\"ok\":true}");
        assert!(outpost_proto::header_get(&response.headers, "content-type").is_some());

        let request_text = seen.await.unwrap();
        assert!(request_text.starts_with("GET /hello?x=1 HTTP/1.1"));
        // forwarded metadata survives, hop-by-hop does not
        assert!(request_text.contains("x-forwarded-host: web.op.example.com"));
        assert!(!request_text.to_ascii_lowercase().contains("connection: keep-alive"));
        assert!(request_text.contains(&format!("host: 127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_fetch_post_body() {
        let (port, seen) = spawn_origin("HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n").await;

        let response = fetch(
            &slot(port),
            "POST",
            "/items",
            &vec![("Content-Type".to_string(), "application/json".to_string())],
            Some(b"{\"name\":\"x\"}".to_vec()),
        )
        .await
        .unwrap();

        assert_eq!(response.status, 204);
        let request_text = seen.await.unwrap();
        assert!(request_text.contains("{\"name\":\"x\"}"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        // bind-then-drop guarantees a closed port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = fetch(&slot(port), "GET", "/", &vec![], None)
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[test]
    fn test_no_app_page_mentions_address() {
        let page = no_app_running_page("127.0.0.1:3000");
        assert!(page.contains("127.0.0.1:3000"));
        assert!(page.contains("<html>"));
    }
}
