//! Engine facade tying the pieces together.
//!
//! The [`TransferEngine`] owns the transfer registry, the per-room listener
//! tables, the typed event bus, and the lifecycle policy (timeouts, grace
//! removal, destruction). Room listeners and the control-plane bridge talk to
//! transfers exclusively through it.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use roomdrop_types::events::TransferEvent;
use roomdrop_types::models::{Protocol, StatusReport};

use crate::error::{ChunkError, TransferError};
use crate::protocol::{
    ALLOWED_MIME_TYPES, COMPLETED_GRACE, IDLE_TIMEOUT, InitData, MAX_FILE_SIZE, TRANSFER_TIMEOUT,
};
use crate::registry::{ActiveTransfer, TransferRegistry};
use crate::transfer::{ChunkOutcome, Transfer};
use crate::{tcp, udp};

/// Tunables for one engine instance. Defaults match the production values;
/// tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Listeners bind on this address. Loopback-only by default.
    pub bind_addr: IpAddr,
    /// Flat directory completed files are written to, served by filename.
    pub upload_dir: PathBuf,
    pub transfer_timeout: Duration,
    pub idle_timeout: Duration,
    /// How long a completed transfer stays queryable before removal.
    pub completed_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            upload_dir: PathBuf::from("./uploads"),
            transfer_timeout: TRANSFER_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            completed_grace: COMPLETED_GRACE,
        }
    }
}

/// A bound room listener: its port, its stop signal, and its driving task.
pub(crate) struct RoomListener {
    pub(crate) port: u16,
    pub(crate) shutdown: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl RoomListener {
    /// Stop accepting and wait for the listener task to release the port.
    async fn close(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }

    /// Synchronous stop for paths that cannot await.
    fn close_now(self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

/// Cheaply cloneable handle to the shared engine state.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    registry: TransferRegistry,
    events: broadcast::Sender<TransferEvent>,
    tcp_rooms: Mutex<HashMap<String, RoomListener>>,
    udp_rooms: Mutex<HashMap<String, RoomListener>>,
}

impl TransferEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: TransferRegistry::new(),
                events,
                tcp_rooms: Mutex::new(HashMap::new()),
                udp_rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to the lifecycle event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn publish(&self, event: TransferEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<Arc<ActiveTransfer>> {
        self.inner.registry.get(id)
    }

    /// Number of transfers currently registered.
    pub fn transfer_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Bound port of a room's listener, if one is active.
    pub fn listener_port(&self, room_id: &str, protocol: Protocol) -> Option<u16> {
        let rooms = self.rooms_for(protocol).lock().expect("listener table poisoned");
        rooms.get(room_id).map(|l| l.port)
    }

    fn rooms_for(&self, protocol: Protocol) -> &Mutex<HashMap<String, RoomListener>> {
        match protocol {
            Protocol::Tcp => &self.inner.tcp_rooms,
            Protocol::Udp => &self.inner.udp_rooms,
        }
    }

    // ── Listener lifecycle ─────────────────────────────────────────────

    /// Bind a room-scoped listener and return the bound port.
    ///
    /// Port 0 asks the OS for an ephemeral port. At most one listener per
    /// room and protocol: a second request fails with `ListenerExists`; a
    /// bind collision fails with `PortInUse` and leaves other rooms alone.
    pub async fn open_listener(
        &self,
        room_id: &str,
        protocol: Protocol,
        port: u16,
    ) -> Result<u16, TransferError> {
        {
            let rooms = self.rooms_for(protocol).lock().expect("listener table poisoned");
            if rooms.contains_key(room_id) {
                return Err(TransferError::ListenerExists {
                    protocol,
                    room_id: room_id.to_string(),
                });
            }
        }

        let addr = SocketAddr::new(self.inner.config.bind_addr, port);
        let (bound, listener) = match protocol {
            Protocol::Tcp => tcp::bind_room(self.clone(), room_id.to_string(), addr).await?,
            Protocol::Udp => udp::bind_room(self.clone(), room_id.to_string(), addr).await?,
        };

        let mut rooms = self.rooms_for(protocol).lock().expect("listener table poisoned");
        if rooms.contains_key(room_id) {
            // lost a race with a concurrent open for the same room
            listener.close_now();
            return Err(TransferError::ListenerExists {
                protocol,
                room_id: room_id.to_string(),
            });
        }
        rooms.insert(room_id.to_string(), listener);

        info!(room_id, %protocol, port = bound, "room listener ready");
        Ok(bound)
    }

    /// Close a room's listeners and clean up its in-flight transfers.
    pub async fn shutdown_room(&self, room_id: &str) {
        let tcp_listener = {
            let mut rooms = self.inner.tcp_rooms.lock().expect("listener table poisoned");
            rooms.remove(room_id)
        };
        let udp_listener = {
            let mut rooms = self.inner.udp_rooms.lock().expect("listener table poisoned");
            rooms.remove(room_id)
        };

        if let Some(listener) = tcp_listener {
            listener.close().await;
            info!(room_id, "TCP listener closed");
        }
        if let Some(listener) = udp_listener {
            listener.close().await;
            info!(room_id, "UDP listener closed");
        }

        for transfer in self.inner.registry.remove_all_for_room(room_id) {
            if transfer.with_state(|s| s.cancel()) {
                self.publish(TransferEvent::Cancelled {
                    transfer_id: transfer.id.clone(),
                    room_id: transfer.room_id.clone(),
                });
            }
            self.destroy(&transfer);
        }
    }

    /// Graceful process-wide shutdown: every room with a listener or an
    /// in-flight transfer is torn down.
    pub async fn shutdown_all(&self) {
        let mut rooms: HashSet<String> = HashSet::new();
        {
            let tcp = self.inner.tcp_rooms.lock().expect("listener table poisoned");
            rooms.extend(tcp.keys().cloned());
        }
        {
            let udp = self.inner.udp_rooms.lock().expect("listener table poisoned");
            rooms.extend(udp.keys().cloned());
        }
        rooms.extend(self.inner.registry.rooms());

        for room_id in rooms {
            self.shutdown_room(&room_id).await;
        }
    }

    // ── Control-plane operations ───────────────────────────────────────

    /// Snapshot a transfer's state, or `None` when unknown.
    pub fn status(&self, transfer_id: &str) -> Option<StatusReport> {
        self.inner
            .registry
            .get(transfer_id)
            .map(|t| t.with_state(|s| s.report()))
    }

    /// Cancel a transfer. Unknown or already-terminal ids report `NotFound`
    /// rather than panicking, so a second cancel is a safe no-op.
    pub fn cancel(&self, transfer_id: &str) -> Result<(), TransferError> {
        let transfer = self
            .inner
            .registry
            .get(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;

        if !transfer.with_state(|s| s.cancel()) {
            return Err(TransferError::NotFound(transfer_id.to_string()));
        }

        info!(transfer_id, room_id = %transfer.room_id, "transfer cancelled");
        self.publish(TransferEvent::Cancelled {
            transfer_id: transfer.id.clone(),
            room_id: transfer.room_id.clone(),
        });
        self.destroy(&transfer);
        Ok(())
    }

    /// Restart a non-terminal transfer from scratch: empty chunk store,
    /// fresh start time, fresh timeout window.
    pub fn retry(&self, transfer_id: &str) -> Result<(), TransferError> {
        let transfer = self
            .inner
            .registry
            .get(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;

        let reset = transfer.with_state(|s| {
            if s.status().is_terminal() {
                false
            } else {
                s.reset_for_retry();
                true
            }
        });
        if !reset {
            return Err(TransferError::NotFound(transfer_id.to_string()));
        }

        self.arm_timeout(&transfer);
        info!(transfer_id, "transfer reset for retry");
        Ok(())
    }

    /// Synchronous validation of an offered file.
    pub fn validate(&self, mime_type: &str, file_size: u64) -> Result<(), TransferError> {
        if !ALLOWED_MIME_TYPES.contains(&mime_type) {
            return Err(TransferError::InvalidFile {
                mime_type: mime_type.to_string(),
                allowed: ALLOWED_MIME_TYPES.join(", "),
            });
        }
        if file_size > MAX_FILE_SIZE {
            return Err(TransferError::FileTooLarge {
                size: file_size,
                limit: MAX_FILE_SIZE,
            });
        }
        Ok(())
    }

    // ── Listener-facing transfer lifecycle ─────────────────────────────

    /// Create and register a transfer for an `init` message, arming its
    /// timeout. A duplicate init for a live id returns the existing transfer.
    pub(crate) fn handle_init(
        &self,
        room_id: &str,
        protocol: Protocol,
        transfer_id: String,
        init: &InitData,
        checksum: Option<&str>,
    ) -> Arc<ActiveTransfer> {
        if let Some(existing) = self.inner.registry.get(&transfer_id) {
            debug!(%transfer_id, "duplicate init for live transfer");
            return existing;
        }

        let mut transfer = Transfer::new(transfer_id.clone(), room_id.to_string(), protocol, init);
        if let Some(sum) = checksum {
            transfer.set_checksum(sum);
        }

        let active = ActiveTransfer::new(transfer);
        self.inner.registry.register(active.clone());
        self.arm_timeout(&active);

        info!(
            %transfer_id,
            room_id,
            %protocol,
            filename = %init.filename,
            file_size = init.file_size,
            total = init.total,
            "transfer initiated"
        );
        active
    }

    /// Store one chunk, emit progress, and finalize when the transfer is
    /// ready. Chunk faults propagate to the caller, which owns the transport.
    pub(crate) async fn handle_chunk(
        &self,
        transfer: &Arc<ActiveTransfer>,
        index: u32,
        data: Bytes,
    ) -> Result<(), TransferError> {
        let (outcome, progress, ready) = transfer.with_state(|s| {
            let outcome = s.add_chunk(index, data);
            (outcome, s.progress(), s.is_ready())
        });

        match outcome? {
            ChunkOutcome::Ignored => Ok(()),
            ChunkOutcome::Stored => {
                debug!(
                    transfer_id = %transfer.id,
                    index,
                    transferred = progress.transferred,
                    total = progress.total,
                    "chunk stored"
                );
                self.publish(TransferEvent::Progress {
                    transfer_id: transfer.id.clone(),
                    room_id: transfer.room_id.clone(),
                    percent: progress.percent,
                    transferred: progress.transferred,
                    total: progress.total,
                    speed_bps: progress.speed_bps,
                });

                if ready {
                    // a verification failure is already published and the
                    // transfer kept for inspection; only add-chunk faults
                    // are the caller's to act on
                    if let Err(err) = self.finalize(transfer).await {
                        debug!(transfer_id = %transfer.id, error = %err, "finalize failed");
                    }
                }
                Ok(())
            }
        }
    }

    /// Record the expected digest; reassemble now if every chunk is present,
    /// otherwise wait for the remainder (datagram loss leaves the transfer to
    /// its timeout — there is no retransmission).
    pub(crate) async fn handle_complete(
        &self,
        transfer: &Arc<ActiveTransfer>,
        checksum: &str,
    ) -> Result<(), TransferError> {
        let ready = transfer.with_state(|s| {
            s.set_checksum(checksum);
            s.is_ready()
        });

        if ready {
            self.finalize(transfer).await
        } else {
            debug!(
                transfer_id = %transfer.id,
                "complete received before all chunks; awaiting remainder"
            );
            Ok(())
        }
    }

    /// Reassemble, verify, persist, and announce completion.
    async fn finalize(&self, transfer: &Arc<ActiveTransfer>) -> Result<(), TransferError> {
        if transfer.is_destroyed() {
            return Ok(());
        }

        // a duplicate `complete` (UDP re-delivery) or a lost race with
        // cancel/timeout must not reassemble twice
        let assembled = transfer.with_state(|s| {
            if s.status().is_terminal() {
                None
            } else {
                Some(s.assemble())
            }
        });
        let Some(assembled) = assembled else {
            return Ok(());
        };
        match assembled {
            Ok(file) => {
                transfer.disarm_timer();

                let filename = transfer.with_state(|s| s.filename.clone());
                if let Err(err) = self.write_upload(&filename, &file.data).await {
                    error!(transfer_id = %transfer.id, error = %err, "failed to persist upload");
                    let err = TransferError::Io(err);
                    self.publish(TransferEvent::Error {
                        transfer_id: transfer.id.clone(),
                        room_id: transfer.room_id.clone(),
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                    self.destroy(transfer);
                    return Err(err);
                }

                info!(
                    transfer_id = %transfer.id,
                    room_id = %transfer.room_id,
                    file_size = file.file_size,
                    duration_secs = file.duration.as_secs_f64(),
                    "transfer complete"
                );
                self.publish(TransferEvent::Complete {
                    transfer_id: transfer.id.clone(),
                    room_id: transfer.room_id.clone(),
                    filename,
                    file_size: file.file_size,
                    duration_secs: file.duration.as_secs_f64(),
                    completed_at: Utc::now(),
                });

                // keep the entry queryable for a grace period, then drop it
                let engine = self.clone();
                let completed = transfer.clone();
                let grace = self.inner.config.completed_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    engine.destroy(&completed);
                });
                Ok(())
            }
            Err(err @ ChunkError::ChecksumMismatch { .. }) => {
                warn!(transfer_id = %transfer.id, error = %err, "checksum verification failed");
                let err = TransferError::Chunk(err);
                self.publish(TransferEvent::Error {
                    transfer_id: transfer.id.clone(),
                    room_id: transfer.room_id.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                // left registered in `failed` state for inspection; the
                // still-armed timeout reclaims it eventually
                Err(err)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Tear a transfer down after a transport or parse fault.
    pub(crate) fn abort_transfer(&self, transfer: &Arc<ActiveTransfer>, err: &TransferError) {
        if transfer.with_state(|s| s.fail()) {
            warn!(transfer_id = %transfer.id, error = %err, "transfer aborted");
            self.publish(TransferEvent::Error {
                transfer_id: transfer.id.clone(),
                room_id: transfer.room_id.clone(),
                code: err.code().to_string(),
                message: err.to_string(),
            });
        }
        self.destroy(transfer);
    }

    /// Timeout path, shared by the per-transfer timer and the TCP idle
    /// watchdog. Fires at most once per transfer.
    pub(crate) fn handle_timeout(&self, transfer_id: &str) {
        let Some(transfer) = self.inner.registry.get(transfer_id) else {
            return;
        };
        if transfer.with_state(|s| s.time_out()) {
            warn!(transfer_id, room_id = %transfer.room_id, "transfer timed out");
            self.publish(TransferEvent::Timeout {
                transfer_id: transfer.id.clone(),
                room_id: transfer.room_id.clone(),
            });
            self.destroy(&transfer);
        }
    }

    fn arm_timeout(&self, transfer: &Arc<ActiveTransfer>) {
        let engine = self.clone();
        let transfer_id = transfer.id.clone();
        let timeout = self.inner.config.transfer_timeout;
        transfer.arm_timer(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.handle_timeout(&transfer_id);
        }));
    }

    /// Release a transfer's resources and drop its registry entry. Safe to
    /// call from racing paths; only the first caller does the work.
    fn destroy(&self, transfer: &Arc<ActiveTransfer>) {
        if !transfer.begin_destroy() {
            return;
        }
        transfer.disarm_timer();
        transfer.with_state(|s| s.clear());
        self.inner.registry.remove(&transfer.id);
        debug!(transfer_id = %transfer.id, "transfer destroyed");
        self.publish(TransferEvent::Destroyed {
            transfer_id: transfer.id.clone(),
        });
    }

    async fn write_upload(&self, filename: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let dir = &self.inner.config.upload_dir;
        tokio::fs::create_dir_all(dir).await?;

        // flat directory: strip any path components the sender supplied
        let safe_name = std::path::Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());

        let path = dir.join(safe_name);
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }
}
