use roomdrop_types::models::Protocol;
use thiserror::Error;

/// Faults detected while receiving or reassembling chunks.
///
/// These surface through a transfer's `Error` event; the transfer is left in
/// `failed` state for inspection rather than torn down on the spot.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk index {index} outside [0, {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("chunk {index} re-delivered with a different payload")]
    PayloadMismatch { index: u32 },

    #[error("transfer incomplete: {received}/{total} chunks")]
    Incomplete { received: u32, total: u32 },

    #[error("checksum verification failed: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// The engine-level error taxonomy.
///
/// Each variant carries a stable string code (see [`TransferError::code`])
/// that the control-plane bridge reports to peers.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid file type {mime_type}, allowed: {allowed}")]
    InvalidFile { mime_type: String, allowed: String },

    #[error("file size {size} exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("port {port} already in use for room {room_id}")]
    PortInUse { port: u16, room_id: String },

    #[error("{protocol} listener already active for room {room_id}")]
    ListenerExists { protocol: Protocol, room_id: String },

    #[error("transfer {0} timed out")]
    Timeout(String),

    #[error("transfer {0} not found")]
    NotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Classify a listener bind failure: an address collision becomes the
    /// distinct `PortInUse` so it is never conflated with generic I/O faults.
    pub fn from_bind(err: std::io::Error, port: u16, room_id: &str) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            Self::PortInUse {
                port,
                room_id: room_id.to_string(),
            }
        } else {
            Self::Io(err)
        }
    }

    /// Stable code reported through the control plane.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFile { .. } => "INVALID_FILE",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::Chunk(_) => "CHUNK_ERROR",
            Self::PortInUse { .. } => "PORT_IN_USE",
            Self::ListenerExists { .. } => "LISTENER_EXISTS",
            Self::Timeout(_) => "TRANSFER_TIMEOUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        let err = TransferError::PortInUse {
            port: 5044,
            room_id: "A1B2C3D4".into(),
        };
        assert_eq!(err.code(), "PORT_IN_USE");
        assert!(err.to_string().contains("5044"));

        let err: TransferError = ChunkError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "ab".into(),
        }
        .into();
        assert_eq!(err.code(), "CHUNK_ERROR");
    }
}
