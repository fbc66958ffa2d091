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


//! Scheduler
//!
//! Admission control over the task store: promotes pending tasks to
//! `downloading` FIFO while the concurrency budget allows, hands them to the
//! transfer engine fire-and-forget, and backfills freed slots as transfers
//! end. A backend load monitor may lower (never raise) the effective budget,
//! sampled on a fixed interval off the hot scheduling path.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::download::engine::TransferEngine;
use crate::download::handle::{ActiveTransfers, TransferHandle};
use crate::download::store::TaskStore;
use crate::download::task::TaskStatus;
use crate::error::Result;

/// Load threshold above which the budget is halved
const HIGH_LOAD: f32 = 0.8;

/// Samples backend load as a factor in `0.0..=1.0`.
///
/// Implemented by the embedder against whatever signal the backend exposes;
/// the scheduler only needs the number.
#[async_trait]
pub trait LoadMonitor: Send + Sync {
    async fn sample(&self) -> Result<f32>;
}

/// Admission controller for the download queue
pub struct Scheduler {
    store: Arc<TaskStore>,
    engine: Arc<TransferEngine>,
    transfers: Arc<ActiveTransfers>,
    max_concurrent: usize,
    /// Budget after load adjustment; read fresh on every pass
    effective_budget: AtomicUsize,
    /// Re-entrancy guard for `process_queue`
    in_flight: AtomicBool,
    /// A pass arrived while another was in flight; run again before releasing
    rerun_requested: AtomicBool,
    load_monitor: Option<Arc<dyn LoadMonitor>>,
    sampler_running: AtomicBool,
    sample_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        engine: Arc<TransferEngine>,
        transfers: Arc<ActiveTransfers>,
        max_concurrent: usize,
        load_monitor: Option<Arc<dyn LoadMonitor>>,
        sample_interval: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            store,
            engine,
            transfers,
            max_concurrent,
            effective_budget: AtomicUsize::new(max_concurrent),
            in_flight: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            load_monitor,
            sampler_running: AtomicBool::new(false),
            sample_interval,
        }
    }

    /// Current effective concurrency budget
    pub fn budget(&self) -> usize {
        self.effective_budget.load(Ordering::Acquire)
    }

    /// Run one admission pass.
    ///
    /// Idempotent and safe to call redundantly; concurrent calls collapse
    /// into one pass via the in-flight flag. Each promoted task is handed to
    /// the engine asynchronously, and the spawned wrapper re-enters
    /// `process_queue` when the transfer ends so freed slots refill without
    /// outside help.
    pub async fn process_queue(self: &Arc<Self>) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            // Someone else is mid-pass; have them look again before leaving
            self.rerun_requested.store(true, Ordering::Release);
            return;
        }

        loop {
            self.rerun_requested.store(false, Ordering::Release);
            self.admit().await;
            if !self.rerun_requested.load(Ordering::Acquire) {
                break;
            }
        }

        self.in_flight.store(false, Ordering::Release);
    }

    /// One admission sweep under the in-flight guard.
    ///
    /// Returns an explicitly boxed `Send` future rather than an `async fn`'s
    /// opaque future: the spawned backfill task re-enters `process_queue`
    /// (which awaits `admit`), and erasing the recursion point behind a
    /// `dyn Future + Send` boundary lets the auto-trait solver prove the
    /// spawned future `Send` instead of chasing the cycle forever.
    fn admit(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.admit_inner())
    }

    async fn admit_inner(self: &Arc<Self>) {
        let budget = self.budget();
        let active = self.store.downloading_count();

        if active < budget {
            let free = budget - active;
            let candidates: Vec<_> = self
                .store
                .pending_in_order()
                .into_iter()
                .take(free)
                .collect();

            for task in candidates {
                debug!(task_id = %task.id, "admitting task");
                if let Err(e) = self
                    .store
                    .update_status(&task.id, TaskStatus::Downloading, None)
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "failed to admit task");
                    continue;
                }

                // Handle goes in before the engine starts so a pause issued
                // immediately after admission still has something to abort.
                let (handle, abort_rx) = TransferHandle::new();
                self.transfers.register(&task.id, handle);

                let scheduler = Arc::clone(self);
                let engine = Arc::clone(&self.engine);
                let task_id = task.id.clone();
                tokio::spawn(async move {
                    let outcome = engine.run(&task_id, abort_rx).await;
                    debug!(task_id = %task_id, ?outcome, "transfer ended");
                    // Backfill the freed slot; failures here must never
                    // starve siblings.
                    scheduler.process_queue().await;
                });
            }

            self.ensure_sampler();
        }
    }

    /// Start the background load sampler if a monitor is configured and
    /// transfers are active. The sampler stops itself once the queue drains.
    fn ensure_sampler(self: &Arc<Self>) {
        let Some(monitor) = self.load_monitor.clone() else {
            return;
        };
        if self.store.downloading_count() == 0 {
            return;
        }
        if self.sampler_running.swap(true, Ordering::AcqRel) {
            return;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.sample_interval);
            // The immediate first tick would sample synchronously with the
            // scheduling pass that spawned us; skip it.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if scheduler.store.downloading_count() == 0 {
                    scheduler.sampler_running.store(false, Ordering::Release);
                    break;
                }

                match monitor.sample().await {
                    Ok(load) => scheduler.apply_load(load).await,
                    Err(e) => warn!(error = %e, "backend load sample failed"),
                }
            }
        });
    }

    async fn apply_load(self: &Arc<Self>, load: f32) {
        let target = if load >= HIGH_LOAD {
            (self.max_concurrent / 2).max(1)
        } else {
            self.max_concurrent
        };

        let previous = self.effective_budget.swap(target, Ordering::AcqRel);
        if previous != target {
            info!(load, previous, target, "adjusted concurrency budget");
            if target > previous {
                // Budget grew: admit immediately instead of waiting for the
                // next completion.
                self.process_queue().await;
            }
        }
    }
}
