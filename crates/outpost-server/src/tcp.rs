//! Public TCP dispatcher
//!
//! Each TCP tunnel gets a listener on its allocated port. Every accepted
//! socket becomes a logical sub-connection on the owning session's control
//! channel: chunks read from the socket go out as `tcp_data` frames, frames
//! from the agent are written back. Byte order is preserved per connection
//! per direction; sending into a saturated control channel awaits, which
//! pauses reading from that socket.

use crate::registry::Tunnel;
use crate::session::{AgentSession, TcpConnHandle};
use outpost_proto::Message;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Chunk size for reads off the public socket.
const READ_BUF: usize = 16 * 1024;

/// Queue depth between the session dispatcher and each socket writer.
const CONN_QUEUE: usize = 64;

/// Event delivered to one public TCP connection.
#[derive(Debug)]
pub enum ConnEvent {
    /// Bytes from the agent to write to the public socket
    Data(Vec<u8>),
    /// The agent (or a teardown path) closed the logical connection
    Close,
}

/// Accept loop for one TCP tunnel. Runs until aborted at teardown.
pub async fn serve_tunnel(listener: TcpListener, tunnel: Arc<Tunnel>, session: Arc<AgentSession>) {
    debug!(tunnel_id = %tunnel.id, port = ?tunnel.public_port, "tcp tunnel listening");
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(tunnel_id = %tunnel.id, "tcp accept failed: {}", e);
                break;
            }
        };
        trace!(tunnel_id = %tunnel.id, %peer, "public tcp connection accepted");
        tunnel.stats.add_connection();
        tokio::spawn(handle_conn(socket, tunnel.clone(), session.clone()));
    }
}

/// One accepted public socket.
///
/// The writer half runs here; the reader half runs as a child task so the
/// writer can abort it when the agent closes the logical connection first.
async fn handle_conn(
    socket: tokio::net::TcpStream,
    tunnel: Arc<Tunnel>,
    session: Arc<AgentSession>,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (events_tx, mut events_rx) = mpsc::channel::<ConnEvent>(CONN_QUEUE);
    session.register_conn(
        &connection_id,
        TcpConnHandle {
            tunnel_id: tunnel.id.clone(),
            events: events_tx,
        },
    );

    let (read_half, mut write_half) = socket.into_split();
    let reader = tokio::spawn(read_loop(
        read_half,
        tunnel.clone(),
        session.clone(),
        connection_id.clone(),
    ));

    let mut agent_closed = false;
    while let Some(event) = events_rx.recv().await {
        match event {
            ConnEvent::Data(data) => {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
                tunnel.stats.add_bytes_out(data.len() as u64);
            }
            ConnEvent::Close => {
                agent_closed = true;
                break;
            }
        }
    }

    let _ = write_half.shutdown().await;
    if agent_closed {
        // the public client may still be sending; drop its read side too
        reader.abort();
    } else {
        let _ = reader.await;
    }
    session.remove_conn(&connection_id);
    trace!(tunnel_id = %tunnel.id, %connection_id, "public tcp connection finished");
}

/// Pump public-socket bytes into `tcp_data` frames until EOF.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    tunnel: Arc<Tunnel>,
    session: Arc<AgentSession>,
    connection_id: String,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tunnel.stats.add_bytes_in(n as u64);
                let sent = session
                    .send(Message::TcpData {
                        tunnel_id: tunnel.id.clone(),
                        connection_id: connection_id.clone(),
                        data: buf[..n].to_vec(),
                    })
                    .await;
                if !sent {
                    return;
                }
            }
        }
    }

    // public side is done; tell the agent and evict the handle so late
    // frames for this id are dropped
    session
        .send(Message::TcpClose {
            tunnel_id: tunnel.id.clone(),
            connection_id: connection_id.clone(),
        })
        .await;
    session.remove_conn(&connection_id);
}
