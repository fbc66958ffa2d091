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


//! Download queue facade
//!
//! The surface presentation layers talk to: add/remove/pause/resume/retry/
//! cancel plus read accessors and the event subscription. Opening a queue
//! loads persisted state, reconciles it through recovery, and runs the first
//! scheduling pass.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::resolver::ResourceResolver;
use crate::config::DownloadConfig;
use crate::download::engine::TransferEngine;
use crate::download::handle::{AbortReason, ActiveTransfers};
use crate::download::recovery::Recovery;
use crate::download::scheduler::{LoadMonitor, Scheduler};
use crate::download::store::TaskStore;
use crate::download::task::{Progress, Quality, Task, TaskStatus, TrackMeta};
use crate::error::{MelodownError, Result};
use crate::events::QueueEvent;
use crate::file::SaveLocator;
use crate::storage::StateStore;

/// Builder for [`DownloadQueue`]
pub struct QueueBuilder {
    config: DownloadConfig,
    resolver: Arc<dyn ResourceResolver>,
    state: Arc<dyn StateStore>,
    credential: Option<String>,
    load_monitor: Option<Arc<dyn LoadMonitor>>,
    save_locator: Option<Arc<dyn SaveLocator>>,
}

impl QueueBuilder {
    pub fn new(
        config: DownloadConfig,
        resolver: Arc<dyn ResourceResolver>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            resolver,
            state,
            credential: None,
            load_monitor: None,
            save_locator: None,
        }
    }

    /// Opaque credential forwarded to the lookup API and the CDN
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Backend load signal for adaptive concurrency
    pub fn load_monitor(mut self, monitor: Arc<dyn LoadMonitor>) -> Self {
        self.load_monitor = Some(monitor);
        self
    }

    /// Save-location prompt used in [`crate::config::SaveMode::Prompt`] mode
    pub fn save_locator(mut self, locator: Arc<dyn SaveLocator>) -> Self {
        self.save_locator = Some(locator);
        self
    }

    /// Load persisted state, run recovery, and start scheduling.
    pub async fn open(self) -> Result<Arc<DownloadQueue>> {
        let store = Arc::new(TaskStore::new(Arc::clone(&self.state)));
        let loaded = store.load().await?;

        // Recovery must precede the first scheduling pass so phantom
        // `downloading` records are never counted against the budget.
        let recovery = Recovery::new();
        let recovered = recovery.reconcile(&store).await?;
        if loaded > 0 {
            info!(loaded, recovered, "download queue state restored");
        }

        let transfers = Arc::new(ActiveTransfers::new());
        let engine = Arc::new(TransferEngine::new(
            Arc::clone(&self.resolver),
            Arc::clone(&store),
            Arc::clone(&transfers),
            self.config.clone(),
            self.credential,
            self.save_locator,
        )?);

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&transfers),
            self.config.max_concurrent,
            self.load_monitor,
            self.config.load_sample_interval,
        ));

        let queue = Arc::new(DownloadQueue {
            config: self.config,
            store,
            scheduler,
            transfers,
            resolver: self.resolver,
        });

        // Restored pending tasks start moving right away
        queue.scheduler.process_queue().await;

        Ok(queue)
    }
}

/// Concurrent download queue with pause/resume, byte-range resumption and
/// crash recovery
pub struct DownloadQueue {
    config: DownloadConfig,
    store: Arc<TaskStore>,
    scheduler: Arc<Scheduler>,
    transfers: Arc<ActiveTransfers>,
    resolver: Arc<dyn ResourceResolver>,
}

impl DownloadQueue {
    /// Start building a queue
    pub fn builder(
        config: DownloadConfig,
        resolver: Arc<dyn ResourceResolver>,
        state: Arc<dyn StateStore>,
    ) -> QueueBuilder {
        QueueBuilder::new(config, resolver, state)
    }

    /// Enqueue a download for (track, quality).
    ///
    /// Re-adding an equivalent task that is still pending/active/paused is a
    /// no-op returning the existing id; an equivalent completed/failed task
    /// is restarted instead of duplicated. The size estimate is refined
    /// asynchronously via the resolver without blocking the caller.
    pub async fn add_task(&self, track: TrackMeta, quality: Quality) -> Result<String> {
        let result = self.store.add_task(&track, quality).await?;
        let task_id = result.task_id().to_string();

        if result.needs_schedule() {
            self.refine_estimate(&task_id, &track.resource_id, quality);
            self.scheduler.process_queue().await;
        }

        Ok(task_id)
    }

    /// Background size/quality refinement after `add_task`
    fn refine_estimate(&self, task_id: &str, resource_id: &str, quality: Quality) {
        let store = Arc::clone(&self.store);
        let resolver = Arc::clone(&self.resolver);
        let task_id = task_id.to_string();
        let resource_id = resource_id.to_string();

        tokio::spawn(async move {
            match resolver.resolve(&resource_id, quality).await {
                Ok(source) => {
                    if let Err(e) = store
                        .set_resolved(
                            &task_id,
                            source.actual_quality,
                            source.total_bytes,
                            source.downgraded,
                        )
                        .await
                    {
                        warn!(task_id = %task_id, error = %e, "failed to record refined estimate");
                    }
                }
                // Best-effort: the engine resolves again before transfer
                Err(e) => debug!(task_id = %task_id, error = %e, "estimate refinement failed"),
            }
        });
    }

    /// Remove a task entirely, aborting its transfer if one is active.
    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        // Best-effort abort; a missing handle just means nothing was active
        self.transfers.abort(task_id, AbortReason::Cancel);
        self.store.remove_task(task_id).await?;
        self.discard_partial(task_id).await;
        self.scheduler.process_queue().await;
        Ok(())
    }

    /// Pause an active download, releasing its transfer handle synchronously.
    pub async fn pause_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .store
            .get(task_id)
            .ok_or_else(|| MelodownError::TaskNotFound(task_id.to_string()))?;

        if task.status != TaskStatus::Downloading {
            return Err(MelodownError::InvalidState(format!(
                "cannot pause task in status {}",
                task.status.as_str()
            )));
        }

        self.transfers.abort(task_id, AbortReason::Pause);
        self.store
            .update_status(task_id, TaskStatus::Paused, None)
            .await?;
        self.scheduler.process_queue().await;
        Ok(())
    }

    /// Resume a paused download from its recorded byte offset.
    pub async fn resume_task(&self, task_id: &str) -> Result<()> {
        self.store.requeue_paused(task_id).await?;
        self.scheduler.process_queue().await;
        Ok(())
    }

    /// Retry a failed download, or re-run a completed one, from byte zero.
    pub async fn retry_task(&self, task_id: &str) -> Result<()> {
        self.store.reset_task(task_id).await?;
        self.discard_partial(task_id).await;
        self.scheduler.process_queue().await;
        Ok(())
    }

    /// Cancel a task: abort its transfer and discard partial state.
    ///
    /// The task stays visible in `error` status ("cancel-to-error") so the
    /// user can still retry it; `remove_task` is the discard path.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .store
            .get(task_id)
            .ok_or_else(|| MelodownError::TaskNotFound(task_id.to_string()))?;

        if task.is_terminal() {
            return Err(MelodownError::InvalidState(format!(
                "cannot cancel task in status {}",
                task.status.as_str()
            )));
        }

        self.transfers.abort(task_id, AbortReason::Cancel);
        // Terminal status first: it blocks any progress write still in
        // flight from the aborted engine
        self.store
            .update_status(task_id, TaskStatus::Error, Some("cancelled by user".to_string()))
            .await?;
        self.store.drop_progress(task_id).await?;
        self.discard_partial(task_id).await;
        self.scheduler.process_queue().await;
        Ok(())
    }

    async fn discard_partial(&self, task_id: &str) {
        let part_path = self.config.part_path(task_id);
        if let Err(e) = tokio::fs::remove_file(&part_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(task_id, error = %e, "failed to remove staging file");
            }
        }
    }

    // ========================================================================
    // Read accessors
    // ========================================================================

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.store.get(task_id)
    }

    pub fn progress(&self, task_id: &str) -> Option<Progress> {
        self.store.get_progress(task_id)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.store.tasks_with_status(status)
    }

    /// All tasks in admission order
    pub fn snapshot(&self) -> Vec<Task> {
        self.store.snapshot()
    }

    pub fn downloading_count(&self) -> usize {
        self.store.downloading_count()
    }

    /// Current effective concurrency budget
    pub fn budget(&self) -> usize {
        self.scheduler.budget()
    }

    /// Subscribe to status/progress notifications
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.store.subscribe()
    }
}
