//! End-to-end tests: real server, real agent, real local origin
//!
//! Covers the paths the protocol-level tests cannot: the agent's origin
//! forwarding, the friendly 502 page, TCP relay through the agent, and
//! reconnect-with-restoration after the server comes back.

use outpost_agent::{Agent, AgentConfig, TunnelSlot};
use outpost_proto::TunnelProtocol;
use outpost_server::{DomainRule, PortRange, RunningServer, Server, ServerConfig};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn test_config(mutate: impl FnOnce(&mut ServerConfig)) -> ServerConfig {
    let mut config = ServerConfig {
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        domains: vec![DomainRule::new("example.com", "op")],
        ..Default::default()
    };
    mutate(&mut config);
    config
}

async fn start_server(mutate: impl FnOnce(&mut ServerConfig)) -> RunningServer {
    Server::new(test_config(mutate))
        .expect("config")
        .bind()
        .await
        .expect("bind")
}

/// Minimal HTTP origin answering every request with a fixed JSON body.
async fn spawn_http_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"ok\":true}",
                    )
                    .await;
            });
        }
    });

    port
}

/// TCP origin that echoes whatever it reads.
async fn spawn_echo_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

fn http_slot(subdomain: &str, origin_port: u16) -> TunnelSlot {
    TunnelSlot {
        name: subdomain.to_string(),
        protocol: TunnelProtocol::Http,
        local_host: "127.0.0.1".to_string(),
        local_port: origin_port,
        subdomain: Some(subdomain.to_string()),
        remote_port: None,
        autostart: true,
    }
}

fn spawn_agent(server: &RunningServer, tunnels: Vec<TunnelSlot>) -> watch::Sender<bool> {
    let config = AgentConfig {
        server_url: format!("ws://{}", server.local_addr()),
        tunnels,
        ..Default::default()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Agent::new(config).run_until(shutdown_rx));
    shutdown_tx
}

async fn wait_for_tunnels(server: &RunningServer, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while server.state().registry.len() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "tunnels never registered"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn public_get(server: &RunningServer, host: &str, path: &str) -> (u16, String) {
    let mut socket = TcpStream::connect(server.local_addr()).await.expect("connect");
    socket
        .write_all(
            format!(
                "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                path, host
            )
            .as_bytes(),
        )
        .await
        .expect("write");

    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.expect("read");
    let response = String::from_utf8_lossy(&response).to_string();

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_happy_path_through_real_agent() {
    let origin_port = spawn_http_origin().await;
    let server = start_server(|_| {}).await;
    let shutdown = spawn_agent(&server, vec![http_slot("web", origin_port)]);

    wait_for_tunnels(&server, 1).await;

    let (status, body) = public_get(&server, "web.op.example.com", "/hello").await;
    assert_eq!(status, 200);
    assert_eq!(body, "{\"ok\":true}");

    let _ = shutdown.send(true);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_origin_down_renders_friendly_page() {
    // bind-then-drop guarantees nothing listens on the origin port
    let origin = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let origin_port = origin.local_addr().expect("addr").port();
    drop(origin);

    let server = start_server(|_| {}).await;
    let shutdown = spawn_agent(&server, vec![http_slot("down", origin_port)]);
    wait_for_tunnels(&server, 1).await;

    let (status, body) = public_get(&server, "down.op.example.com", "/").await;
    assert_eq!(status, 502);
    assert!(body.contains("app is not"));
    assert!(body.contains(&format!("127.0.0.1:{}", origin_port)));

    let _ = shutdown.send(true);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_relay_through_real_agent() {
    let origin_port = spawn_echo_origin().await;
    let server = start_server(|config| {
        config.tunnel_port_range = PortRange {
            min: 21_060,
            max: 21_070,
        };
    })
    .await;

    let shutdown = spawn_agent(
        &server,
        vec![TunnelSlot {
            name: "echo".to_string(),
            protocol: TunnelProtocol::Tcp,
            local_host: "127.0.0.1".to_string(),
            local_port: origin_port,
            subdomain: None,
            remote_port: Some(21_063),
            autostart: true,
        }],
    );
    wait_for_tunnels(&server, 1).await;

    let mut public = TcpStream::connect("127.0.0.1:21063").await.expect("connect");
    public.write_all(b"ping-1").await.expect("write");
    let mut buf = [0u8; 6];
    public.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"ping-1");

    // a second message on the same connection stays in order
    public.write_all(b"ping-2").await.expect("write");
    public.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"ping-2");

    let _ = shutdown.send(true);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_restores_tunnels() {
    let origin_port = spawn_http_origin().await;

    let first = start_server(|config| {
        config.tunnel_port_range = PortRange {
            min: 21_080,
            max: 21_090,
        };
    })
    .await;
    let server_port = first.local_addr().port();

    let shutdown = spawn_agent(
        &first,
        vec![
            http_slot("web", origin_port),
            TunnelSlot {
                name: "db".to_string(),
                protocol: TunnelProtocol::Tcp,
                local_host: "127.0.0.1".to_string(),
                local_port: origin_port,
                subdomain: None,
                remote_port: Some(21_085),
                autostart: true,
            },
        ],
    );
    wait_for_tunnels(&first, 2).await;
    let url_before = first
        .state()
        .registry
        .lookup_subdomain("web")
        .expect("tunnel")
        .public_url
        .clone();

    // drop the server; in-flight tunnels die with it
    first.shutdown().await;

    // come back on the same port; the agent's desired set drives restoration
    let second = Server::new(test_config(|config| {
        config.port = server_port;
        config.tunnel_port_range = PortRange {
            min: 21_080,
            max: 21_090,
        };
    }))
    .expect("config")
    .bind()
    .await
    .expect("rebind");

    wait_for_tunnels(&second, 2).await;
    let restored = second
        .state()
        .registry
        .lookup_subdomain("web")
        .expect("tunnel restored");
    assert_eq!(restored.public_url, url_before);
    assert!(second.state().registry.lookup_port(21_085).is_some());

    // and traffic flows again
    let (status, body) = public_get(&second, "web.op.example.com", "/again").await;
    assert_eq!(status, 200);
    assert_eq!(body, "{\"ok\":true}");

    let _ = shutdown.send(true);
    second.shutdown().await;
}
