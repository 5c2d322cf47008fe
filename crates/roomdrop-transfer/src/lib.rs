//! Roomdrop transfer engine: chunked file transfer for room-scoped
//! TCP and UDP listeners.
//!
//! - Fixed-size chunking with index-ordered reassembly
//! - SHA-256 end-to-end integrity verification
//! - Per-room listeners, many concurrent transfers multiplexed across rooms
//! - Lifecycle management: progress, timeout, cancellation, retry
//! - Typed event bus feeding the control-plane bridge

pub mod engine;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod registry;
pub mod sender;
pub mod transfer;

mod tcp;
mod udp;

// Re-export key types for convenience.
pub use engine::{EngineConfig, TransferEngine};
pub use error::{ChunkError, TransferError};
pub use protocol::{CHUNK_SIZE, InitData, UDP_CHUNK_SIZE, WireMessage, total_chunks};
pub use sender::{SendReport, send_file, send_file_tcp, send_file_udp};
pub use transfer::{AssembledFile, ChunkOutcome, ProgressUpdate, Transfer};
