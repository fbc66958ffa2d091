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


//! Queue event notifications
//!
//! Presentation layers subscribe instead of polling. Events are broadcast
//! best-effort: a lagging subscriber drops old events, it never blocks the
//! queue.

use serde::Serialize;

use crate::download::task::{Quality, TaskStatus};

/// Status-change notification emitted by the task store
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    TaskAdded {
        task_id: String,
    },
    StatusChanged {
        task_id: String,
        status: TaskStatus,
        error: Option<String>,
    },
    ProgressUpdated {
        task_id: String,
        bytes_loaded: u64,
        total_bytes: u64,
    },
    /// The server substituted a lower quality than requested; fired before
    /// the byte transfer begins
    QualityDowngraded {
        task_id: String,
        requested: Quality,
        actual: Quality,
    },
    TaskRemoved {
        task_id: String,
    },
}

impl QueueEvent {
    /// Task this event concerns
    pub fn task_id(&self) -> &str {
        match self {
            QueueEvent::TaskAdded { task_id }
            | QueueEvent::StatusChanged { task_id, .. }
            | QueueEvent::ProgressUpdated { task_id, .. }
            | QueueEvent::QualityDowngraded { task_id, .. }
            | QueueEvent::TaskRemoved { task_id } => task_id,
        }
    }
}
