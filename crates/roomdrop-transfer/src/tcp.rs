//! Room-scoped TCP listener.
//!
//! One stream listener per room. Every accepted connection carries at most
//! one transfer: the first `init` creates it lazily, later messages on the
//! same connection route to it, and the server closes the connection after
//! `complete` triggers reassembly. Connection state lives in an explicit
//! per-connection context rather than captured closure variables.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use roomdrop_types::models::Protocol;

use crate::engine::{RoomListener, TransferEngine};
use crate::error::{ChunkError, TransferError};
use crate::framing::read_message;
use crate::protocol::{KEEPALIVE_INTERVAL, WireMessage};
use crate::registry::ActiveTransfer;

/// Bind the room listener and spawn its accept loop.
pub(crate) async fn bind_room(
    engine: TransferEngine,
    room_id: String,
    addr: SocketAddr,
) -> Result<(u16, RoomListener), TransferError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TransferError::from_bind(e, addr.port(), &room_id))?;
    let port = listener.local_addr()?.port();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(accept_loop(engine, room_id, listener, shutdown.clone()));

    Ok((port, RoomListener { port, shutdown, task }))
}

async fn accept_loop(
    engine: TransferEngine,
    room_id: String,
    listener: TcpListener,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    apply_keepalive(&stream, peer);
                    let conn = ConnContext::new(engine.clone(), room_id.clone(), peer);
                    tokio::spawn(conn.run(stream, token.child_token()));
                }
                Err(err) => {
                    warn!(%room_id, error = %err, "accept failed");
                }
            }
        }
    }
    debug!(%room_id, "TCP accept loop stopped");
}

fn apply_keepalive(stream: &TcpStream, peer: SocketAddr) {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
    let sock = socket2::SockRef::from(stream);
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        debug!(%peer, error = %err, "could not enable keep-alive");
    }
}

enum Flow {
    Continue,
    Close,
}

/// Per-connection state: the room it serves, the peer, and the one transfer
/// bound to this connection once `init` arrives.
struct ConnContext {
    engine: TransferEngine,
    room_id: String,
    peer: SocketAddr,
    transfer: Option<Arc<ActiveTransfer>>,
}

impl ConnContext {
    fn new(engine: TransferEngine, room_id: String, peer: SocketAddr) -> Self {
        Self {
            engine,
            room_id,
            peer,
            transfer: None,
        }
    }

    async fn run(mut self, mut stream: TcpStream, token: CancellationToken) {
        debug!(room_id = %self.room_id, peer = %self.peer, "connection accepted");
        let idle = self.engine.config().idle_timeout;

        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => break,
                read = tokio::time::timeout(idle, read_message(&mut stream)) => match read {
                    Err(_) => {
                        warn!(peer = %self.peer, "connection idle timeout");
                        if let Some(transfer) = &self.transfer {
                            self.engine.handle_timeout(&transfer.id);
                        }
                        break;
                    }
                    Ok(Ok(Some(msg))) => msg,
                    Ok(Ok(None)) => {
                        // peer closed the stream
                        self.abandon();
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!(peer = %self.peer, error = %err, "receive error");
                        if let Some(transfer) = &self.transfer {
                            self.engine.abort_transfer(transfer, &err);
                        }
                        break;
                    }
                }
            };

            match self.dispatch(msg).await {
                Flow::Continue => {}
                Flow::Close => break,
            }
        }

        debug!(peer = %self.peer, "connection closed");
    }

    async fn dispatch(&mut self, msg: WireMessage) -> Flow {
        match msg {
            WireMessage::Init { data, checksum } => {
                if self.transfer.is_some() {
                    warn!(peer = %self.peer, "duplicate init on connection, ignoring");
                    return Flow::Continue;
                }
                let active = self.engine.handle_init(
                    &self.room_id,
                    Protocol::Tcp,
                    data.transfer_id.clone(),
                    &data,
                    checksum.as_deref(),
                );
                self.transfer = Some(active);
                Flow::Continue
            }

            WireMessage::Chunk { index, data } => {
                let Some(transfer) = self.transfer.clone() else {
                    warn!(peer = %self.peer, "chunk before init, ignoring");
                    return Flow::Continue;
                };
                match self.engine.handle_chunk(&transfer, index, data).await {
                    Ok(()) => Flow::Continue,
                    Err(err) => {
                        self.engine.abort_transfer(&transfer, &err);
                        self.transfer = None;
                        Flow::Close
                    }
                }
            }

            WireMessage::Complete { checksum } => {
                if let Some(transfer) = self.transfer.take() {
                    if let Err(err) = self.engine.handle_complete(&transfer, &checksum).await {
                        // failure already published; the transfer stays
                        // registered in `failed` state for inspection
                        debug!(transfer_id = %transfer.id, error = %err, "completion failed");
                    }
                }
                // server closes the connection after triggering reassembly
                Flow::Close
            }
        }
    }

    /// Peer vanished mid-transfer: discard partial data.
    fn abandon(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            let (received, total) = transfer.with_state(|s| (s.received(), s.total()));
            let err = TransferError::Chunk(ChunkError::Incomplete { received, total });
            self.engine.abort_transfer(&transfer, &err);
        }
    }
}
