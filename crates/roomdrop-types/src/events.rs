use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle events published by the transfer engine.
///
/// Every component that needs to observe transfers subscribes to the engine's
/// event bus and receives these; there is no global emitter. The control-plane
/// bridge forwards them verbatim to connected peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransferEvent {
    /// A chunk was stored; percentage and throughput recomputed.
    Progress {
        transfer_id: String,
        room_id: String,
        /// Whole percent, 0–100.
        percent: u8,
        transferred: u32,
        total: u32,
        /// Instantaneous throughput in bytes per second.
        speed_bps: f64,
    },

    /// All chunks arrived and the checksum matched.
    Complete {
        transfer_id: String,
        room_id: String,
        filename: String,
        file_size: u64,
        duration_secs: f64,
        completed_at: DateTime<Utc>,
    },

    /// The transfer failed (checksum mismatch, malformed chunk, transport
    /// fault). `code` is one of the stable error codes.
    Error {
        transfer_id: String,
        room_id: String,
        code: String,
        message: String,
    },

    /// The inactivity timer fired before completion.
    Timeout {
        transfer_id: String,
        room_id: String,
    },

    /// The transfer was cancelled explicitly or by room shutdown.
    Cancelled {
        transfer_id: String,
        room_id: String,
    },

    /// The transfer's resources were released and its registry entry removed.
    Destroyed { transfer_id: String },
}

impl TransferEvent {
    /// The transfer this event concerns.
    pub fn transfer_id(&self) -> &str {
        match self {
            Self::Progress { transfer_id, .. }
            | Self::Complete { transfer_id, .. }
            | Self::Error { transfer_id, .. }
            | Self::Timeout { transfer_id, .. }
            | Self::Cancelled { transfer_id, .. }
            | Self::Destroyed { transfer_id } => transfer_id,
        }
    }
}
