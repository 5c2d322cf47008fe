//! Wire format for chunked transfers.
//!
//! Three self-describing message kinds, exchanged as JSON tagged unions:
//!
//! ```text
//! init:     { "type":"init", "data":{ "transferId", "filename", "fileSize", "total" } }
//! chunk:    { "type":"chunk", "index":N, "data":"<base64 bytes>" }
//! complete: { "type":"complete", "checksum":"<hex sha-256>" }
//! ```
//!
//! Over TCP each message travels in a length-prefixed frame (see
//! [`crate::framing`]); over UDP one datagram carries exactly one message.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use roomdrop_types::models::Protocol;

/// Chunk payload size over TCP: 64 KiB. The final chunk may be shorter.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunk payload size over UDP: 32 KiB.
///
/// A 64 KiB chunk grows past the 65 507-byte UDP payload ceiling once
/// base64-encoded, so datagram transfers slice smaller.
pub const UDP_CHUNK_SIZE: usize = 32 * 1024;

/// Upper bound on a framed message: envelope + base64-expanded chunk.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Receive buffer for one datagram. Larger than any legal UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// OS receive buffer requested for room datagram sockets (8 MB).
pub const UDP_RECV_BUFFER: usize = 8 * 1024 * 1024;

/// A transfer with no completion after this long is reclaimed.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Per-connection idle timeout on TCP room listeners.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// How long a completed transfer stays queryable before removal.
pub const COMPLETED_GRACE: Duration = Duration::from_secs(30);

/// TCP keep-alive probe interval on accepted connections.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Validation ceiling on offered files (50 MB).
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// File types accepted by [`crate::engine::TransferEngine::validate`].
pub const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "application/pdf"];

/// Chunk payload size used by the given transport.
pub fn chunk_size_for(protocol: Protocol) -> usize {
    match protocol {
        Protocol::Tcp => CHUNK_SIZE,
        Protocol::Udp => UDP_CHUNK_SIZE,
    }
}

/// Number of chunks a file of `file_size` bytes splits into.
pub fn total_chunks(file_size: u64, chunk_size: usize) -> u32 {
    file_size.div_ceil(chunk_size as u64) as u32
}

/// One application message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// Announces an incoming file and its shape. Senders that know the
    /// digest up front may attach it here instead of waiting for `complete`.
    Init {
        data: InitData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    /// One slice of the file, tagged with its position.
    Chunk {
        index: u32,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    /// End of stream; carries the digest to verify against.
    Complete { checksum: String },
}

/// Payload of an `init` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
    pub transfer_id: String,
    pub filename: String,
    pub file_size: u64,
    pub total: u32,
}

/// Serde adapter: binary chunk payloads as standard base64 strings.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
