use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Protocol, StatusReport};

/// Control-plane messages exchanged over the bridge WebSocket (JSON, tagged
/// union). Commands flow client → server, the rest server → client; lifecycle
/// events travel on the same socket as [`crate::events::TransferEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    // Client → Server
    /// Ask for a room-scoped transfer listener. The bridge draws the port.
    OpenTransfer { room_id: String, protocol: Protocol },
    /// Offer a file to the room. Validated synchronously.
    SendFile {
        room_id: String,
        filename: String,
        file_size: u64,
        mime_type: String,
        protocol: Protocol,
        from_username: String,
    },
    AcceptFile {
        transfer_id: String,
        protocol: Protocol,
        port: u16,
    },
    RejectFile { transfer_id: String },
    GetStatus { transfer_id: String },
    CancelTransfer { transfer_id: String },
    RetryTransfer { transfer_id: String },

    // Server → Client
    TransferReady {
        room_id: String,
        protocol: Protocol,
        port: u16,
    },
    FileIncoming {
        transfer_id: String,
        room_id: String,
        from_username: String,
        filename: String,
        file_size: u64,
        protocol: Protocol,
        sent_at: DateTime<Utc>,
    },
    FileAccepted {
        transfer_id: String,
        protocol: Protocol,
        port: u16,
    },
    FileRejected {
        transfer_id: String,
        reason: String,
    },
    Status { report: Option<StatusReport> },
    ActionResult { success: bool, message: String },
    ControlError { code: String, message: String },
}
