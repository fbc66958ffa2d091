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


//! Task store
//!
//! Single source of truth for task and progress records. In-memory maps are
//! mutated under short lock sections (never across an await); every mutation
//! is written through the pluggable [`StateStore`] afterwards and announced
//! on the event channel.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::download::progress::estimate_eta;
use crate::download::task::{Progress, Quality, Task, TaskStatus, TrackMeta};
use crate::error::{MelodownError, Result};
use crate::events::QueueEvent;
use crate::storage::StateStore;

/// Event channel capacity; laggards lose old events rather than block
const EVENT_CAPACITY: usize = 256;

/// Minimum ETA delta (seconds) worth overwriting the stored estimate for
const ETA_CHANGE_THRESHOLD: u64 = 3;

/// What [`TaskStore::add_task`] did with the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResult {
    /// A new task was created
    Created(String),
    /// An equivalent terminal task existed and was reset to pending
    Restarted(String),
    /// An equivalent non-terminal task already exists; nothing changed
    Existing(String),
}

impl AddResult {
    pub fn task_id(&self) -> &str {
        match self {
            AddResult::Created(id) | AddResult::Restarted(id) | AddResult::Existing(id) => id,
        }
    }

    /// True when the call changed queue state and a scheduling pass is due
    pub fn needs_schedule(&self) -> bool {
        !matches!(self, AddResult::Existing(_))
    }
}

/// Durable mapping of task id → task record + progress sub-record
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    progress: RwLock<HashMap<String, Progress>>,
    next_seq: AtomicU64,
    state: Arc<dyn StateStore>,
    events: broadcast::Sender<QueueEvent>,
}

impl TaskStore {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tasks: RwLock::new(HashMap::new()),
            progress: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            state,
            events,
        }
    }

    /// Populate the in-memory maps from the durable store.
    ///
    /// Called once at startup, before recovery runs.
    pub async fn load(&self) -> Result<usize> {
        let persisted = self.state.load_all().await?;
        let count = persisted.len();
        let mut max_seq = 0u64;

        {
            let mut tasks = self.tasks.write().expect("task map lock poisoned");
            let mut progress = self.progress.write().expect("progress map lock poisoned");
            for entry in persisted {
                max_seq = max_seq.max(entry.task.seq + 1);
                if let Some(p) = entry.progress {
                    progress.insert(entry.task.id.clone(), p);
                }
                tasks.insert(entry.task.id.clone(), entry.task);
            }
        }

        self.next_seq.store(max_seq, Ordering::SeqCst);
        debug!(count, "loaded persisted tasks");
        Ok(count)
    }

    /// Subscribe to status/progress notifications
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine; the queue works headless.
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add a download task for (resource, quality).
    ///
    /// An equivalent non-terminal task makes this a no-op; an equivalent
    /// terminal task is reset to pending instead of duplicated.
    pub async fn add_task(&self, meta: &TrackMeta, quality: Quality) -> Result<AddResult> {
        enum Planned {
            Existing(String),
            Restarted(Task),
            Created(Task),
        }

        let planned = {
            let mut tasks = self.tasks.write().expect("task map lock poisoned");

            let equivalent = tasks
                .values()
                .find(|t| t.resource_id == meta.resource_id && t.requested_quality == quality)
                .cloned();

            match equivalent {
                Some(existing) if !existing.is_terminal() => {
                    debug!(
                        task_id = %existing.id,
                        resource_id = %meta.resource_id,
                        "equivalent task already queued, ignoring"
                    );
                    Planned::Existing(existing.id)
                }
                Some(existing) => {
                    let task = tasks
                        .get_mut(&existing.id)
                        .expect("existing task present under write lock");
                    task.status = TaskStatus::Pending;
                    task.error = None;
                    task.completed_at = None;
                    Planned::Restarted(task.clone())
                }
                None => {
                    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                    let task = Task::new(meta, quality, seq);
                    tasks.insert(task.id.clone(), task.clone());
                    Planned::Created(task)
                }
            }
        };

        match planned {
            Planned::Existing(id) => Ok(AddResult::Existing(id)),
            Planned::Restarted(task) => {
                self.drop_progress(&task.id).await?;
                self.state.upsert_task(&task).await?;
                self.emit(QueueEvent::StatusChanged {
                    task_id: task.id.clone(),
                    status: TaskStatus::Pending,
                    error: None,
                });
                Ok(AddResult::Restarted(task.id))
            }
            Planned::Created(task) => {
                self.state.upsert_task(&task).await?;
                self.emit(QueueEvent::TaskAdded {
                    task_id: task.id.clone(),
                });
                Ok(AddResult::Created(task.id))
            }
        }
    }

    /// Set a task's status (and error for terminal failures).
    ///
    /// Tolerates a task that was removed mid-transfer: the engine may finish
    /// after a remove, and that must not become an error.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<()> {
        let updated = {
            let mut tasks = self.tasks.write().expect("task map lock poisoned");
            match tasks.get_mut(task_id) {
                Some(task) => {
                    task.status = status;
                    task.error = error.clone();
                    task.completed_at = if status == TaskStatus::Completed {
                        Some(Utc::now())
                    } else {
                        None
                    };
                    Some(task.clone())
                }
                None => None,
            }
        };

        let Some(task) = updated else {
            debug!(task_id, ?status, "status update for removed task, ignoring");
            return Ok(());
        };

        if status == TaskStatus::Completed {
            self.drop_progress(task_id).await?;
        }

        self.state.upsert_task(&task).await?;
        self.emit(QueueEvent::StatusChanged {
            task_id: task_id.to_string(),
            status,
            error,
        });
        Ok(())
    }

    /// Write a task's progress record, recomputing the ETA.
    ///
    /// The ETA only moves when it changes by more than a small threshold, so
    /// a steady transfer does not churn subscribers with ±1s estimates.
    pub async fn update_progress(
        &self,
        task_id: &str,
        bytes_loaded: u64,
        total_bytes: u64,
        speed_bps: f64,
    ) -> Result<()> {
        // A write racing a cancel/remove must not resurrect the record
        match self.get(task_id) {
            Some(task) if !task.is_terminal() => {}
            _ => {
                debug!(task_id, "progress write for settled task, ignoring");
                return Ok(());
            }
        }

        let record = {
            let mut progress = self.progress.write().expect("progress map lock poisoned");
            let previous_eta = progress.get(task_id).and_then(|p| p.eta_seconds);

            let eta = match (estimate_eta(bytes_loaded, total_bytes, speed_bps), previous_eta) {
                (Some(new), Some(old)) if new.abs_diff(old) <= ETA_CHANGE_THRESHOLD => Some(old),
                (new, _) => new,
            };

            let record = Progress {
                bytes_loaded,
                total_bytes,
                speed_bps,
                eta_seconds: eta,
                last_update: Utc::now(),
            };
            progress.insert(task_id.to_string(), record.clone());
            record
        };

        // Keep the task's authoritative size in step once it is known
        let task_update = {
            let mut tasks = self.tasks.write().expect("task map lock poisoned");
            match tasks.get_mut(task_id) {
                Some(task) if task.total_bytes == 0 && total_bytes > 0 => {
                    task.total_bytes = total_bytes;
                    Some(task.clone())
                }
                _ => None,
            }
        };
        if let Some(task) = task_update {
            self.state.upsert_task(&task).await?;
        }

        self.state.upsert_progress(task_id, &record).await?;
        self.emit(QueueEvent::ProgressUpdated {
            task_id: task_id.to_string(),
            bytes_loaded,
            total_bytes,
        });
        Ok(())
    }

    /// Record the resolver's answer on the task.
    ///
    /// Fires the downgrade notification before any bytes move, so the UI can
    /// tell the user what it is actually downloading.
    pub async fn set_resolved(
        &self,
        task_id: &str,
        actual_quality: Quality,
        total_bytes: u64,
        downgraded: bool,
    ) -> Result<()> {
        let (task, announce) = {
            let mut tasks = self.tasks.write().expect("task map lock poisoned");
            let Some(task) = tasks.get_mut(task_id) else {
                debug!(task_id, "resolution result for removed task, ignoring");
                return Ok(());
            };

            let announce = downgraded && !task.was_downgraded;
            task.actual_quality = Some(actual_quality);
            task.was_downgraded = downgraded;
            if total_bytes > 0 {
                task.total_bytes = total_bytes;
                task.file_size_estimate = total_bytes;
            }
            (task.clone(), announce)
        };

        self.state.upsert_task(&task).await?;
        if announce {
            self.emit(QueueEvent::QualityDowngraded {
                task_id: task_id.to_string(),
                requested: task.requested_quality,
                actual: actual_quality,
            });
        }
        Ok(())
    }

    /// Move a paused task back to pending, keeping its progress (resume)
    pub async fn requeue_paused(&self, task_id: &str) -> Result<()> {
        {
            let mut tasks = self.tasks.write().expect("task map lock poisoned");
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| MelodownError::TaskNotFound(task_id.to_string()))?;
            if task.status != TaskStatus::Paused {
                return Err(MelodownError::InvalidState(format!(
                    "cannot resume task in status {}",
                    task.status.as_str()
                )));
            }
            task.status = TaskStatus::Pending;
            task.error = None;
        }
        self.persist_and_announce(task_id, TaskStatus::Pending).await
    }

    /// Reset a terminal task to pending, discarding progress (retry/re-run)
    pub async fn reset_task(&self, task_id: &str) -> Result<()> {
        {
            let mut tasks = self.tasks.write().expect("task map lock poisoned");
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| MelodownError::TaskNotFound(task_id.to_string()))?;
            if !task.status.is_terminal() {
                return Err(MelodownError::InvalidState(format!(
                    "cannot retry task in status {}",
                    task.status.as_str()
                )));
            }
            task.status = TaskStatus::Pending;
            task.error = None;
            task.completed_at = None;
        }
        self.drop_progress(task_id).await?;
        self.persist_and_announce(task_id, TaskStatus::Pending).await
    }

    async fn persist_and_announce(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let task = self
            .get(task_id)
            .ok_or_else(|| MelodownError::TaskNotFound(task_id.to_string()))?;
        self.state.upsert_task(&task).await?;
        self.emit(QueueEvent::StatusChanged {
            task_id: task_id.to_string(),
            status,
            error: None,
        });
        Ok(())
    }

    /// Delete a task's progress record everywhere
    pub async fn drop_progress(&self, task_id: &str) -> Result<()> {
        {
            let mut progress = self.progress.write().expect("progress map lock poisoned");
            progress.remove(task_id);
        }
        self.state.clear_progress(task_id).await
    }

    /// Delete a task and its progress record.
    ///
    /// Aborting any active transfer is the caller's responsibility; the
    /// store only owns records.
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        let existed = {
            let mut tasks = self.tasks.write().expect("task map lock poisoned");
            let mut progress = self.progress.write().expect("progress map lock poisoned");
            progress.remove(task_id);
            tasks.remove(task_id).is_some()
        };

        if !existed {
            warn!(task_id, "remove requested for unknown task");
            return Ok(());
        }

        self.state.remove(task_id).await?;
        self.emit(QueueEvent::TaskRemoved {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, task_id: &str) -> Option<Task> {
        let tasks = self.tasks.read().expect("task map lock poisoned");
        tasks.get(task_id).cloned()
    }

    pub fn get_progress(&self, task_id: &str) -> Option<Progress> {
        let progress = self.progress.read().expect("progress map lock poisoned");
        progress.get(task_id).cloned()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        let tasks = self.tasks.read().expect("task map lock poisoned");
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.seq);
        matching
    }

    /// Pending tasks in FIFO admission order
    pub fn pending_in_order(&self) -> Vec<Task> {
        self.tasks_with_status(TaskStatus::Pending)
    }

    pub fn downloading_count(&self) -> usize {
        let tasks = self.tasks.read().expect("task map lock poisoned");
        tasks
            .values()
            .filter(|t| t.status == TaskStatus::Downloading)
            .count()
    }

    /// All tasks in admission order
    pub fn snapshot(&self) -> Vec<Task> {
        let tasks = self.tasks.read().expect("task map lock poisoned");
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by_key(|t| t.seq);
        all
    }
}
