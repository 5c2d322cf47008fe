use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport used for a transfer. Chosen by the sending peer per transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

/// Lifecycle state of a transfer.
///
/// `Pending` is entered at init, `Receiving` on the first chunk. The four
/// remaining states are terminal, except that a retry loops a non-terminal
/// transfer back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Receiving,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time snapshot of a transfer, returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub transfer_id: String,
    pub room_id: String,
    pub protocol: Protocol,
    pub status: TransferStatus,
    /// Whole percent, 0–100.
    pub progress: u8,
    /// Instantaneous throughput in bytes per second.
    pub speed_bps: f64,
    pub transferred: u32,
    pub total: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_wire_form_is_uppercase() {
        assert_eq!(serde_json::to_string(&Protocol::Tcp).unwrap(), "\"TCP\"");
        let p: Protocol = serde_json::from_str("\"UDP\"").unwrap();
        assert_eq!(p, Protocol::Udp);
    }

    #[test]
    fn status_wire_form_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&TransferStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!TransferStatus::Pending.is_terminal());
        assert!(!TransferStatus::Receiving.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::TimedOut.is_terminal());
    }
}
