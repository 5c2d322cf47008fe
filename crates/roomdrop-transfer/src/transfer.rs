//! Per-file transfer state machine.
//!
//! A [`Transfer`] accumulates chunks into a slot vector preallocated to the
//! announced chunk count, tracks progress, and reassembles + verifies once
//! every slot is filled and the expected digest is known. It is a plain state
//! machine: no sockets, no timers. The engine owns the I/O and the timeout.

use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use roomdrop_types::models::{Protocol, StatusReport, TransferStatus};

use crate::error::ChunkError;
use crate::protocol::{InitData, chunk_size_for};

/// What `add_chunk` did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Newly stored; a progress notification should go out.
    Stored,
    /// Identical re-delivery or a terminal transfer; accepted silently.
    Ignored,
}

/// Progress snapshot emitted after each stored chunk.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub transferred: u32,
    pub total: u32,
    pub speed_bps: f64,
}

/// A fully reassembled, checksum-verified file.
#[derive(Debug)]
pub struct AssembledFile {
    pub data: Bytes,
    pub file_size: u64,
    pub duration: Duration,
}

/// State for one logical file-sending operation.
pub struct Transfer {
    pub id: String,
    pub room_id: String,
    pub protocol: Protocol,
    pub filename: String,
    pub file_size: u64,
    status: TransferStatus,
    slots: Vec<Option<Bytes>>,
    received: u32,
    expected_checksum: Option<String>,
    chunk_size: usize,
    started: Instant,
}

impl Transfer {
    pub fn new(id: String, room_id: String, protocol: Protocol, init: &InitData) -> Self {
        Self {
            id,
            room_id,
            protocol,
            filename: init.filename.clone(),
            file_size: init.file_size,
            status: TransferStatus::Pending,
            slots: vec![None; init.total as usize],
            received: 0,
            expected_checksum: None,
            chunk_size: chunk_size_for(protocol),
            started: Instant::now(),
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn total(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the digest to verify against. Lowercased so that hex case on
    /// the wire never causes a spurious mismatch.
    pub fn set_checksum(&mut self, checksum: &str) {
        self.expected_checksum = Some(checksum.to_ascii_lowercase());
    }

    /// All slots filled and a digest to compare against is known.
    pub fn is_ready(&self) -> bool {
        self.received == self.total() && self.expected_checksum.is_some()
    }

    /// Store one chunk.
    ///
    /// Out-of-range indices are rejected, as is re-delivery of an index with
    /// a different payload. Re-delivery of identical bytes is idempotent.
    pub fn add_chunk(&mut self, index: u32, data: Bytes) -> Result<ChunkOutcome, ChunkError> {
        if self.status.is_terminal() {
            return Ok(ChunkOutcome::Ignored);
        }

        let total = self.total();
        if index >= total {
            return Err(ChunkError::IndexOutOfRange { index, total });
        }

        match &self.slots[index as usize] {
            Some(existing) if *existing == data => return Ok(ChunkOutcome::Ignored),
            Some(_) => return Err(ChunkError::PayloadMismatch { index }),
            None => {}
        }

        self.slots[index as usize] = Some(data);
        self.received += 1;
        if self.status == TransferStatus::Pending {
            self.status = TransferStatus::Receiving;
        }
        Ok(ChunkOutcome::Stored)
    }

    /// Current percentage/throughput snapshot.
    pub fn progress(&self) -> ProgressUpdate {
        let total = self.total();
        let percent = if total == 0 {
            0
        } else {
            ((self.received as u64 * 100) / total as u64) as u8
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let speed_bps = if elapsed > 0.0 {
            (self.received as f64 * self.chunk_size as f64) / elapsed
        } else {
            0.0
        };

        ProgressUpdate {
            percent,
            transferred: self.received,
            total,
            speed_bps,
        }
    }

    /// Concatenate the chunks in index order, digest, and verify.
    ///
    /// On mismatch the transfer moves to `failed` and the chunk store is left
    /// intact for inspection. On match it moves to `completed`.
    pub fn assemble(&mut self) -> Result<AssembledFile, ChunkError> {
        let total = self.total();
        if self.received < total {
            return Err(ChunkError::Incomplete {
                received: self.received,
                total,
            });
        }
        let expected = self
            .expected_checksum
            .clone()
            .ok_or(ChunkError::Incomplete {
                received: self.received,
                total,
            })?;

        let mut data = Vec::with_capacity(self.file_size as usize);
        for slot in &self.slots {
            // every slot is Some: received == total
            if let Some(chunk) = slot {
                data.extend_from_slice(chunk);
            }
        }

        let actual = hex::encode(Sha256::digest(&data));
        if actual != expected {
            self.status = TransferStatus::Failed;
            return Err(ChunkError::ChecksumMismatch { expected, actual });
        }

        self.status = TransferStatus::Completed;
        Ok(AssembledFile {
            file_size: data.len() as u64,
            data: Bytes::from(data),
            duration: self.started.elapsed(),
        })
    }

    /// Transition to `cancelled`. Returns false if already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TransferStatus::Cancelled;
        true
    }

    /// Transition to `timed_out`. Returns false if already terminal.
    pub fn time_out(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TransferStatus::TimedOut;
        true
    }

    /// Transition to `failed` on a transport or parse fault.
    pub fn fail(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TransferStatus::Failed;
        true
    }

    /// Drop every stored chunk and restart the lifecycle for a retry.
    ///
    /// The expected checksum is kept: a re-sent stream will overwrite it.
    pub fn reset_for_retry(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.received = 0;
        self.status = TransferStatus::Pending;
        self.started = Instant::now();
    }

    /// Release chunk memory on destruction.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.slots.shrink_to_fit();
    }

    pub fn report(&self) -> StatusReport {
        let progress = self.progress();
        StatusReport {
            transfer_id: self.id.clone(),
            room_id: self.room_id.clone(),
            protocol: self.protocol,
            status: self.status,
            progress: progress.percent,
            speed_bps: progress.speed_bps,
            transferred: progress.transferred,
            total: progress.total,
        }
    }
}
