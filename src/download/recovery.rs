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


//! Start-up recovery
//!
//! A freshly started process cannot have a task in `downloading`; any such
//! record is an artifact of state persisted by a prior, now-dead process.
//! Recovery reconciles those into `paused` — progress intact, error cleared,
//! no transfer handle recreated — and must run before the first scheduling
//! pass so phantom transfers are never counted against the budget.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::download::store::TaskStore;
use crate::download::task::TaskStatus;
use crate::error::Result;

/// One-shot reconciliation of stale persisted state
#[derive(Debug, Default)]
pub struct Recovery {
    ran: AtomicBool,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile tasks frozen mid-transfer by a dead process.
    ///
    /// Guarded to run exactly once per process lifetime; later calls are
    /// no-ops. Returns the number of tasks reconciled.
    pub async fn reconcile(&self, store: &TaskStore) -> Result<usize> {
        if self.ran.swap(true, Ordering::AcqRel) {
            debug!("recovery already ran, skipping");
            return Ok(0);
        }

        let stale = store.tasks_with_status(TaskStatus::Downloading);
        let count = stale.len();

        for task in stale {
            debug!(task_id = %task.id, "reconciling task frozen mid-transfer");
            store
                .update_status(&task.id, TaskStatus::Paused, None)
                .await?;
        }

        if count > 0 {
            info!(count, "recovered interrupted downloads into paused state");
        }
        Ok(count)
    }
}
