//! Message framing for stream transports.
//!
//! A stream socket may coalesce or split writes arbitrarily, so messages are
//! carried in explicit frames:
//!
//! ```text
//! +------------------+------------------------+
//! | length (u32, BE) | JSON payload           |
//! +------------------+------------------------+
//! ```
//!
//! Datagram transports skip this layer; one datagram is one message.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChunkError, TransferError};
use crate::protocol::{MAX_FRAME_SIZE, WireMessage};

/// Length prefix size in bytes.
pub const FRAME_PREFIX: usize = 4;

/// Encode `msg` and write one complete frame.
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let payload =
        serde_json::to_vec(msg).map_err(|e| ChunkError::Malformed(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ChunkError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame and decode it.
///
/// Returns `Ok(None)` on a clean end of stream, i.e. EOF landing exactly on a
/// frame boundary. EOF inside a frame is a [`ChunkError::Malformed`].
pub async fn read_message<R>(reader: &mut R) -> Result<Option<WireMessage>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_PREFIX];
    let mut filled = 0;
    while filled < FRAME_PREFIX {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(
                ChunkError::Malformed("stream ended inside a frame prefix".into()).into(),
            );
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ChunkError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => TransferError::Chunk(ChunkError::Malformed(
                "stream ended inside a frame payload".into(),
            )),
            _ => TransferError::Io(e),
        })?;

    let msg = serde_json::from_slice(&payload)
        .map_err(|e| ChunkError::Malformed(e.to_string()))?;
    Ok(Some(msg))
}
