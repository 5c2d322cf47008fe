//! Process-wide table of active transfers.
//!
//! The registry owns every in-flight [`Transfer`] via an [`ActiveTransfer`]
//! wrapper that adds the pieces the engine needs around the state machine:
//! a lock for multi-task access, the scoped timeout timer, and a destroy-once
//! latch so completion, cancellation, and timeout can race safely.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;

use roomdrop_types::models::Protocol;

use crate::transfer::Transfer;

/// A registered transfer plus its timer and destruction latch.
pub struct ActiveTransfer {
    pub id: String,
    pub room_id: String,
    pub protocol: Protocol,
    state: Mutex<Transfer>,
    timer: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl ActiveTransfer {
    pub fn new(transfer: Transfer) -> Arc<Self> {
        Arc::new(Self {
            id: transfer.id.clone(),
            room_id: transfer.room_id.clone(),
            protocol: transfer.protocol,
            state: Mutex::new(transfer),
            timer: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Run `f` with the state machine locked.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut Transfer) -> T) -> T {
        let mut guard = self.state.lock().expect("transfer state lock poisoned");
        f(&mut guard)
    }

    /// Install the one-shot timeout task, aborting any previous one.
    pub fn arm_timer(&self, handle: JoinHandle<()>) {
        let mut timer = self.timer.lock().expect("transfer timer lock poisoned");
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
    }

    pub fn disarm_timer(&self) {
        let mut timer = self.timer.lock().expect("transfer timer lock poisoned");
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }

    /// Claim the right to destroy. Exactly one caller ever gets `true`.
    pub fn begin_destroy(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Maps `transferId → ActiveTransfer` with a room-scoped secondary index.
#[derive(Default)]
pub struct TransferRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    transfers: HashMap<String, Arc<ActiveTransfer>>,
    rooms: HashMap<String, HashSet<String>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a transfer, indexing it under its room. An existing entry for
    /// the same id is returned so the caller can decide what to do with it.
    pub fn register(&self, transfer: Arc<ActiveTransfer>) -> Option<Arc<ActiveTransfer>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .rooms
            .entry(transfer.room_id.clone())
            .or_default()
            .insert(transfer.id.clone());
        inner.transfers.insert(transfer.id.clone(), transfer)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ActiveTransfer>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.transfers.get(id).cloned()
    }

    /// Remove one transfer and prune its room index entry.
    pub fn remove(&self, id: &str) -> Option<Arc<ActiveTransfer>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let removed = inner.transfers.remove(id)?;
        if let Some(ids) = inner.rooms.get_mut(&removed.room_id) {
            ids.remove(id);
            if ids.is_empty() {
                inner.rooms.remove(&removed.room_id);
            }
        }
        Some(removed)
    }

    /// Drain every transfer belonging to `room_id`.
    ///
    /// Entries leave the index in the same critical section, so no caller can
    /// observe a half-shut room; the engine destroys each returned transfer.
    pub fn remove_all_for_room(&self, room_id: &str) -> Vec<Arc<ActiveTransfer>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(ids) = inner.rooms.remove(room_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.transfers.remove(id))
            .collect()
    }

    /// Rooms that currently have at least one registered transfer.
    pub fn rooms(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.rooms.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
