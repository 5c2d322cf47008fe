//! Sender-side chunked uploader.
//!
//! Reads a file sequentially, slices it into chunks with monotonically
//! increasing indices, and ships `init` → `chunk`×N → `complete` to the
//! destination, accumulating a running SHA-256 over the exact bytes sent.
//! TCP streams framed messages over a single connection; UDP sends one
//! datagram per message. Failures propagate to the caller — nothing is
//! silently abandoned mid-stream.

use std::path::Path;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};
use uuid::Uuid;

use roomdrop_types::models::Protocol;

use crate::error::{ChunkError, TransferError};
use crate::framing::write_message;
use crate::protocol::{InitData, WireMessage, chunk_size_for, total_chunks};

/// Summary of a finished upload.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub transfer_id: String,
    pub protocol: Protocol,
    pub filename: String,
    pub file_size: u64,
    pub chunks_sent: u32,
    /// Hex SHA-256 of the bytes sent, as announced in `complete`.
    pub checksum: String,
}

/// Upload a file with the given transport.
pub async fn send_file(
    path: impl AsRef<Path>,
    target: std::net::SocketAddr,
    protocol: Protocol,
) -> Result<SendReport, TransferError> {
    match protocol {
        Protocol::Tcp => send_file_tcp(path, target).await,
        Protocol::Udp => send_file_udp(path, target).await,
    }
}

/// Upload over a single TCP connection using framed messages.
pub async fn send_file_tcp(
    path: impl AsRef<Path>,
    target: std::net::SocketAddr,
) -> Result<SendReport, TransferError> {
    let path = path.as_ref();
    let (filename, file_size) = inspect(path).await?;
    let chunk_size = chunk_size_for(Protocol::Tcp);
    let total = total_chunks(file_size, chunk_size);
    let transfer_id = Uuid::new_v4().to_string();

    let mut stream = TcpStream::connect(target).await?;
    write_message(
        &mut stream,
        &WireMessage::Init {
            data: InitData {
                transfer_id: transfer_id.clone(),
                filename: filename.clone(),
                file_size,
                total,
            },
            checksum: None,
        },
    )
    .await?;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size];
    let mut sent: u64 = 0;

    for index in 0..total {
        let to_read = ((file_size - sent) as usize).min(chunk_size);
        file.read_exact(&mut buf[..to_read]).await?;
        hasher.update(&buf[..to_read]);

        write_message(
            &mut stream,
            &WireMessage::Chunk {
                index,
                data: Bytes::copy_from_slice(&buf[..to_read]),
            },
        )
        .await?;
        sent += to_read as u64;
        debug!(%transfer_id, index, total, "chunk sent");
    }

    let checksum = hex::encode(hasher.finalize());
    write_message(
        &mut stream,
        &WireMessage::Complete {
            checksum: checksum.clone(),
        },
    )
    .await?;
    // the receiver closes after triggering reassembly; a reset here is fine
    let _ = stream.shutdown().await;

    info!(%transfer_id, file_size, chunks = total, "TCP upload finished");
    Ok(SendReport {
        transfer_id,
        protocol: Protocol::Tcp,
        filename,
        file_size,
        chunks_sent: total,
        checksum,
    })
}

/// Upload as a sequence of independent datagrams.
///
/// The receiver keys the transfer by this socket's origin address, so every
/// message goes out through the one bound socket. Datagram loss is not
/// detected here; an incomplete transfer is the receiver's timeout to reclaim.
pub async fn send_file_udp(
    path: impl AsRef<Path>,
    target: std::net::SocketAddr,
) -> Result<SendReport, TransferError> {
    let path = path.as_ref();
    let (filename, file_size) = inspect(path).await?;
    let chunk_size = chunk_size_for(Protocol::Udp);
    let total = total_chunks(file_size, chunk_size);
    let transfer_id = Uuid::new_v4().to_string();

    let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;

    send_datagram(
        &socket,
        target,
        &WireMessage::Init {
            data: InitData {
                transfer_id: transfer_id.clone(),
                filename: filename.clone(),
                file_size,
                total,
            },
            checksum: None,
        },
    )
    .await?;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size];
    let mut sent: u64 = 0;

    for index in 0..total {
        let to_read = ((file_size - sent) as usize).min(chunk_size);
        file.read_exact(&mut buf[..to_read]).await?;
        hasher.update(&buf[..to_read]);

        send_datagram(
            &socket,
            target,
            &WireMessage::Chunk {
                index,
                data: Bytes::copy_from_slice(&buf[..to_read]),
            },
        )
        .await?;
        sent += to_read as u64;
    }

    let checksum = hex::encode(hasher.finalize());
    send_datagram(
        &socket,
        target,
        &WireMessage::Complete {
            checksum: checksum.clone(),
        },
    )
    .await?;

    info!(%transfer_id, file_size, chunks = total, "UDP upload finished");
    Ok(SendReport {
        transfer_id,
        protocol: Protocol::Udp,
        filename,
        file_size,
        chunks_sent: total,
        checksum,
    })
}

async fn inspect(path: &Path) -> Result<(String, u64), TransferError> {
    let meta = tokio::fs::metadata(path).await?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());
    Ok((filename, meta.len()))
}

async fn send_datagram(
    socket: &UdpSocket,
    target: std::net::SocketAddr,
    msg: &WireMessage,
) -> Result<(), TransferError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| ChunkError::Malformed(e.to_string()))?;
    socket.send_to(&payload, target).await?;
    Ok(())
}
