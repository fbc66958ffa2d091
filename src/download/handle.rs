// Melodown - Music Player & Downloader
// Copyright (C) 2025 Melodown contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Active transfer handles
//!
//! One handle per in-flight transfer: the abort side of a oneshot channel
//! whose receiver lives inside the engine invocation that owns the stream.
//! Handles are in-memory only and are never persisted; they exist exactly
//! while a task is `downloading`.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Why an in-flight transfer is being aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// User pause: progress is preserved for resumption
    Pause,
    /// Cancel/remove: partial state is discarded
    Cancel,
}

/// Abort handle for one task's in-flight transfer
#[derive(Debug)]
pub struct TransferHandle {
    abort_tx: oneshot::Sender<AbortReason>,
}

impl TransferHandle {
    /// Create a handle plus the receiver the engine selects on
    pub fn new() -> (Self, oneshot::Receiver<AbortReason>) {
        let (abort_tx, abort_rx) = oneshot::channel();
        (Self { abort_tx }, abort_rx)
    }

    fn abort(self, reason: AbortReason) {
        // The engine may have finished in the meantime; a dead receiver is fine.
        let _ = self.abort_tx.send(reason);
    }
}

/// Registry of active transfer handles, keyed by task id
#[derive(Debug, Default)]
pub struct ActiveTransfers {
    inner: Mutex<HashMap<String, TransferHandle>>,
}

impl ActiveTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle for a task about to start transferring
    pub fn register(&self, task_id: &str, handle: TransferHandle) {
        let mut inner = self.inner.lock().expect("transfer registry lock poisoned");
        if inner.insert(task_id.to_string(), handle).is_some() {
            debug!(task_id, "replaced stale transfer handle");
        }
    }

    /// Abort a task's transfer, releasing the handle synchronously.
    ///
    /// Best-effort: returns false when no transfer was active.
    pub fn abort(&self, task_id: &str, reason: AbortReason) -> bool {
        let handle = {
            let mut inner = self.inner.lock().expect("transfer registry lock poisoned");
            inner.remove(task_id)
        };
        match handle {
            Some(handle) => {
                handle.abort(reason);
                true
            }
            None => false,
        }
    }

    /// Drop a task's handle without signalling (engine cleanup path)
    pub fn deregister(&self, task_id: &str) {
        let mut inner = self.inner.lock().expect("transfer registry lock poisoned");
        inner.remove(task_id);
    }

    pub fn contains(&self, task_id: &str) -> bool {
        let inner = self.inner.lock().expect("transfer registry lock poisoned");
        inner.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("transfer registry lock poisoned");
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
