//! Room-scoped UDP listener.
//!
//! One datagram socket per room. UDP has no connection concept, so concurrent
//! senders are demultiplexed by their `(address, port)` origin, which doubles
//! as the transfer id. Each datagram carries exactly one JSON message and is
//! parsed independently; out-of-order arrival is routine and duplicates fall
//! out of the idempotent chunk store. Lost datagrams are never re-requested —
//! an incomplete transfer is reclaimed by its timeout.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use roomdrop_types::models::Protocol;

use crate::engine::{RoomListener, TransferEngine};
use crate::error::TransferError;
use crate::protocol::{MAX_DATAGRAM_SIZE, UDP_RECV_BUFFER, WireMessage};

/// Bind the room's datagram socket and spawn its receive loop.
pub(crate) async fn bind_room(
    engine: TransferEngine,
    room_id: String,
    addr: SocketAddr,
) -> Result<(u16, RoomListener), TransferError> {
    let socket = create_room_socket(addr)
        .map_err(|e| TransferError::from_bind(e, addr.port(), &room_id))?;
    let socket = UdpSocket::from_std(socket)?;
    let port = socket.local_addr()?.port();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(recv_loop(engine, room_id, socket, shutdown.clone()));

    Ok((port, RoomListener { port, shutdown, task }))
}

async fn recv_loop(
    engine: TransferEngine,
    room_id: String,
    socket: UdpSocket,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, origin)) => {
                    handle_datagram(&engine, &room_id, &buf[..len], origin).await;
                }
                Err(err) => {
                    warn!(%room_id, error = %err, "datagram receive error");
                }
            }
        }
    }
    debug!(%room_id, "UDP receive loop stopped");
}

async fn handle_datagram(
    engine: &TransferEngine,
    room_id: &str,
    payload: &[u8],
    origin: SocketAddr,
) {
    let msg: WireMessage = match serde_json::from_slice(payload) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(room_id, %origin, error = %err, "malformed datagram, dropping");
            return;
        }
    };

    // sender origin doubles as the transfer id
    let transfer_id = origin.to_string();

    match msg {
        WireMessage::Init { data, checksum } => {
            engine.handle_init(
                room_id,
                Protocol::Udp,
                transfer_id,
                &data,
                checksum.as_deref(),
            );
        }

        WireMessage::Chunk { index, data } => {
            let Some(transfer) = engine.lookup(&transfer_id) else {
                debug!(%origin, "chunk for unknown transfer, dropping");
                return;
            };
            if let Err(err) = engine.handle_chunk(&transfer, index, data).await {
                // a single bad datagram does not kill the transfer; drop it
                // and let the remaining traffic (or the timeout) decide
                warn!(transfer_id = %transfer.id, error = %err, "chunk rejected");
            }
        }

        WireMessage::Complete { checksum } => {
            let Some(transfer) = engine.lookup(&transfer_id) else {
                debug!(%origin, "complete for unknown transfer, dropping");
                return;
            };
            if let Err(err) = engine.handle_complete(&transfer, &checksum).await {
                debug!(transfer_id = %transfer.id, error = %err, "completion failed");
            }
        }
    }
}

/// Build the datagram socket with an enlarged OS receive buffer so bursts of
/// chunks from fast senders are not dropped at the kernel boundary.
fn create_room_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol as SockProtocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_recv_buffer_size(UDP_RECV_BUFFER)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
