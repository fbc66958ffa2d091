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


//! Transfer engine
//!
//! Performs one task's byte transfer end to end: resolve the source, open
//! the HTTP stream (with a `Range` offset when resuming), stream chunks into
//! a `.part` file, throttle progress reporting, enforce an inactivity
//! timeout, and classify the terminal outcome. Every failure mode is folded
//! into a [`TransferOutcome`]; nothing escapes to the scheduler.
//!
//! Resume accounting is raw bytes: `Progress.bytes_loaded` must equal the
//! `.part` file length at rest, and the engine restarts from zero rather
//! than risk a corrupt artifact when the two disagree.

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, COOKIE, RANGE};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::api::resolver::ResourceResolver;
use crate::config::{DownloadConfig, SaveMode};
use crate::download::handle::{AbortReason, ActiveTransfers};
use crate::download::progress::{ProgressThrottle, SpeedTracker};
use crate::download::store::TaskStore;
use crate::download::task::{Quality, Task, TaskStatus};
use crate::error::{MelodownError, Result};
use crate::file::{naming, sniff, SaveLocator};

/// Write-buffer size for the staging file
const WRITE_BUF_SZ: usize = 8 * 1024;

/// Bytes sniffed from the payload head for format detection
const SNIFF_LEN: usize = 16;

/// Terminal classification of one transfer attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    /// Paused — by the user, or by a resumable connection drop
    Paused,
    /// Cancelled/removed by the user; partial state already discarded
    Cancelled,
    Failed(String),
}

/// Fine-grained end state, collapsed into [`TransferOutcome`] after the
/// status write. Distinguishes user aborts (status already written by the
/// caller) from engine-decided endings.
enum TransferEnd {
    Completed,
    UserPaused,
    UserCancelled,
    /// Transient connection drop: resumable, becomes `paused`
    Dropped(String),
    Failed(String),
}

enum Phase<T> {
    Aborted(AbortReason),
    Done(T),
}

/// Race a transfer step against the abort channel
async fn with_abort<F>(abort_rx: &mut oneshot::Receiver<AbortReason>, step: F) -> Phase<F::Output>
where
    F: std::future::Future,
{
    tokio::select! {
        reason = &mut *abort_rx => {
            // A closed channel means the handle was dropped without a
            // reason; treat it like a pause so progress survives.
            Phase::Aborted(reason.unwrap_or(AbortReason::Pause))
        }
        output = step => Phase::Done(output),
    }
}

/// Executes a single task's transfer
pub struct TransferEngine {
    client: reqwest::Client,
    resolver: Arc<dyn ResourceResolver>,
    store: Arc<TaskStore>,
    transfers: Arc<ActiveTransfers>,
    config: DownloadConfig,
    credential: Option<String>,
    locator: Option<Arc<dyn SaveLocator>>,
}

impl TransferEngine {
    pub fn new(
        resolver: Arc<dyn ResourceResolver>,
        store: Arc<TaskStore>,
        transfers: Arc<ActiveTransfers>,
        config: DownloadConfig,
        credential: Option<String>,
        locator: Option<Arc<dyn SaveLocator>>,
    ) -> Result<Self> {
        // No overall request timeout: long transfers are bounded by the
        // per-chunk inactivity timeout instead.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            resolver,
            store,
            transfers,
            config,
            credential,
            locator,
        })
    }

    /// Run the transfer for `task_id`, classifying the ending.
    ///
    /// The task's Active Transfer Handle is deregistered on every path out
    /// of this function. Status writes: the engine records `completed`,
    /// `error` and drop-induced `paused`; user-initiated pause/cancel wrote
    /// their status before aborting and are left alone.
    pub async fn run(
        &self,
        task_id: &str,
        mut abort_rx: oneshot::Receiver<AbortReason>,
    ) -> TransferOutcome {
        let end = match self.transfer(task_id, &mut abort_rx).await {
            Ok(end) => end,
            // Local I/O or persistence trouble ends the task, not the queue
            Err(e) => {
                error!(task_id, error = %e, "transfer aborted by local failure");
                TransferEnd::Failed(e.user_message())
            }
        };

        self.transfers.deregister(task_id);

        match end {
            TransferEnd::Completed => {
                self.record_status(task_id, TaskStatus::Completed, None).await;
                info!(task_id, "download completed");
                TransferOutcome::Completed
            }
            TransferEnd::UserPaused => {
                debug!(task_id, "transfer paused by user");
                TransferOutcome::Paused
            }
            TransferEnd::UserCancelled => {
                debug!(task_id, "transfer cancelled by user");
                TransferOutcome::Cancelled
            }
            TransferEnd::Dropped(reason) => {
                warn!(task_id, %reason, "connection dropped, leaving task resumable");
                self.record_status(task_id, TaskStatus::Paused, None).await;
                TransferOutcome::Paused
            }
            TransferEnd::Failed(message) => {
                self.record_status(task_id, TaskStatus::Error, Some(message.clone()))
                    .await;
                TransferOutcome::Failed(message)
            }
        }
    }

    async fn record_status(&self, task_id: &str, status: TaskStatus, error: Option<String>) {
        if let Err(e) = self.store.update_status(task_id, status, error).await {
            error!(task_id, error = %e, "failed to record task status");
        }
    }

    async fn transfer(
        &self,
        task_id: &str,
        abort_rx: &mut oneshot::Receiver<AbortReason>,
    ) -> Result<TransferEnd> {
        let Some(task) = self.store.get(task_id) else {
            // Removed between admission and start
            return Ok(TransferEnd::UserCancelled);
        };

        // Step 1: resolve the source. Transient failures were already
        // retried inside the resolver; whatever comes back is final.
        let source = match with_abort(
            abort_rx,
            self.resolver.resolve(&task.resource_id, task.requested_quality),
        )
        .await
        {
            Phase::Aborted(AbortReason::Pause) => return Ok(TransferEnd::UserPaused),
            Phase::Aborted(AbortReason::Cancel) => return Ok(TransferEnd::UserCancelled),
            Phase::Done(Ok(source)) => source,
            Phase::Done(Err(e)) => {
                warn!(task_id, error = %e, "resolution failed");
                return Ok(TransferEnd::Failed(e.user_message()));
            }
        };

        // Downgrade info must land on the task before any bytes move
        self.store
            .set_resolved(
                task_id,
                source.actual_quality,
                source.total_bytes,
                source.downgraded,
            )
            .await?;

        // Step 2: compute the resume offset and reconcile it with the
        // staging file
        let part_path = self.config.part_path(task_id);
        let total_known = self.store.get(task_id).map(|t| t.total_bytes).unwrap_or(0);
        let recorded = self
            .store
            .get_progress(task_id)
            .map(|p| p.bytes_loaded)
            .unwrap_or(0);
        let offset = self
            .reconcile_offset(task_id, &part_path, recorded, total_known)
            .await?;

        // Step 3: open the stream, branching explicitly on 200 vs 206
        let (response, offset) = match self.open_stream(task_id, &source.url, offset, abort_rx).await? {
            StreamStart::Aborted(AbortReason::Pause) => return Ok(TransferEnd::UserPaused),
            StreamStart::Aborted(AbortReason::Cancel) => return Ok(TransferEnd::UserCancelled),
            StreamStart::Ended(end) => return Ok(end),
            StreamStart::Open { response, offset } => (response, offset),
        };

        let total_bytes = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let total = parse_content_range_total(&response)?;
                if total_known > 0 && total != total_known {
                    return Err(MelodownError::ContentLengthMismatch {
                        expected: total_known,
                        actual: total,
                    });
                }
                total
            }
            // Full content: offset is 0 here by construction
            _ => response
                .content_length()
                .filter(|l| *l > 0)
                .unwrap_or_else(|| source.total_bytes.max(total_known)),
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Step 4/5: stream chunks with throttled progress and an
        // inactivity timeout
        let end = self
            .pump(task_id, response, &part_path, offset, total_bytes, abort_rx)
            .await?;
        let bytes = match end {
            PumpEnd::Finished(bytes) => bytes,
            PumpEnd::Stopped(end) => return Ok(end),
        };

        if total_bytes > 0 && bytes != total_bytes {
            warn!(task_id, bytes, total_bytes, "stream ended early");
            return Ok(TransferEnd::Dropped(format!(
                "transfer incomplete: {bytes}/{total_bytes} bytes"
            )));
        }

        // Step 6: type, name and persist the finished file
        match self.finalize(&task, &part_path, content_type.as_deref()).await {
            Ok(path) => {
                debug!(task_id, path = %path.display(), "artifact persisted");
                Ok(TransferEnd::Completed)
            }
            Err(e) => {
                error!(task_id, error = %e, "failed to persist artifact");
                Ok(TransferEnd::Failed(e.user_message()))
            }
        }
    }

    /// Validate the recorded resume offset against the staging file.
    ///
    /// Any tail the progress record does not cover is trimmed; a file
    /// shorter than the record cannot be trusted, so the transfer restarts
    /// from zero.
    async fn reconcile_offset(
        &self,
        task_id: &str,
        part_path: &Path,
        recorded: u64,
        total_known: u64,
    ) -> Result<u64> {
        let offset = if recorded > 0 && total_known > 0 {
            recorded
        } else {
            0
        };

        let on_disk = tokio::fs::metadata(part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        if offset == 0 {
            return Ok(0);
        }

        if on_disk < offset {
            warn!(
                task_id,
                recorded = offset,
                on_disk,
                "staging file shorter than recorded progress, restarting from zero"
            );
            return Ok(0);
        }

        if on_disk > offset {
            debug!(task_id, recorded = offset, on_disk, "trimming unrecorded tail");
            let file = OpenOptions::new().write(true).open(part_path).await?;
            file.set_len(offset).await?;
        }

        Ok(offset)
    }

    /// Issue the GET (with `Range` when resuming) and normalize the status
    /// handling, retrying once from zero when the recorded range is stale.
    async fn open_stream(
        &self,
        task_id: &str,
        url: &str,
        mut offset: u64,
        abort_rx: &mut oneshot::Receiver<AbortReason>,
    ) -> Result<StreamStart> {
        loop {
            let response = match with_abort(abort_rx, self.send_request(url, offset)).await {
                Phase::Aborted(reason) => return Ok(StreamStart::Aborted(reason)),
                Phase::Done(Ok(response)) => response,
                Phase::Done(Err(e)) if e.is_transient() => {
                    warn!(task_id, error = %e, "could not open stream");
                    return Ok(StreamStart::Ended(TransferEnd::Dropped(e.to_string())));
                }
                Phase::Done(Err(e)) => {
                    return Ok(StreamStart::Ended(TransferEnd::Failed(e.user_message())));
                }
            };

            match response.status() {
                StatusCode::OK => {
                    if offset > 0 {
                        // Server ignored the range request; the resume state
                        // is useless, start over instead of corrupting output
                        info!(task_id, "server ignored range request, restarting from zero");
                        offset = 0;
                    }
                    return Ok(StreamStart::Open { response, offset });
                }
                StatusCode::PARTIAL_CONTENT => {
                    return Ok(StreamStart::Open { response, offset });
                }
                StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                    info!(task_id, offset, "recorded range no longer satisfiable");
                    offset = 0;
                    continue;
                }
                status => {
                    let e = MelodownError::UnexpectedStatus {
                        status: status.as_u16(),
                    };
                    return Ok(StreamStart::Ended(if e.is_transient() {
                        TransferEnd::Dropped(e.to_string())
                    } else {
                        TransferEnd::Failed(e.user_message())
                    }));
                }
            }
        }
    }

    async fn send_request(&self, url: &str, offset: u64) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(ref credential) = self.credential {
            request = request.header(COOKIE, credential);
        }
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = request
            .send()
            .await
            .map_err(|e| MelodownError::network(format!("transfer request failed: {e}"), true))?;
        Ok(response)
    }

    /// Streaming loop: write chunks, throttle progress writes, reset the
    /// inactivity timer on every chunk received.
    async fn pump(
        &self,
        task_id: &str,
        response: reqwest::Response,
        part_path: &Path,
        offset: u64,
        total_bytes: u64,
        abort_rx: &mut oneshot::Receiver<AbortReason>,
    ) -> Result<PumpEnd> {
        if let Some(parent) = part_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = if offset > 0 {
            OpenOptions::new().append(true).open(part_path).await?
        } else {
            File::create(part_path).await?
        };
        let mut writer = BufWriter::with_capacity(WRITE_BUF_SZ, file);

        let quality = self
            .store
            .get(task_id)
            .map(|t| t.effective_quality())
            .unwrap_or(Quality::High);
        let inactivity = self.config.inactivity_timeout(quality);

        let mut stream = response.bytes_stream();
        let mut bytes = offset;
        let mut speed = SpeedTracker::new();
        let mut throttle =
            ProgressThrottle::new(self.config.progress_interval, self.config.progress_byte_quantum);
        throttle.reset_to(offset);

        // Resumed tasks report their starting position immediately
        self.store
            .update_progress(task_id, bytes, total_bytes, 0.0)
            .await?;

        loop {
            let next = tokio::select! {
                reason = &mut *abort_rx => {
                    writer.flush().await?;
                    let reason = reason.unwrap_or(AbortReason::Pause);
                    if reason == AbortReason::Pause {
                        // Preserve the resume point; cancelled state is
                        // being discarded by the caller
                        self.store
                            .update_progress(task_id, bytes, total_bytes, speed.average_speed())
                            .await?;
                    }
                    return Ok(PumpEnd::Stopped(match reason {
                        AbortReason::Pause => TransferEnd::UserPaused,
                        AbortReason::Cancel => TransferEnd::UserCancelled,
                    }));
                }
                next = tokio::time::timeout(inactivity, stream.next()) => next,
            };

            match next {
                // Inactivity timeout: a fault, not a pause
                Err(_) => {
                    writer.flush().await?;
                    self.store
                        .update_progress(task_id, bytes, total_bytes, 0.0)
                        .await?;
                    let e = MelodownError::InactivityTimeout(inactivity.as_secs().max(1));
                    return Ok(PumpEnd::Stopped(TransferEnd::Failed(e.user_message())));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    writer.flush().await?;
                    self.store
                        .update_progress(task_id, bytes, total_bytes, 0.0)
                        .await?;
                    return Ok(PumpEnd::Stopped(TransferEnd::Dropped(e.to_string())));
                }
                Ok(Some(Ok(chunk))) => {
                    writer.write_all(&chunk).await?;
                    bytes += chunk.len() as u64;
                    speed.add_position(bytes);
                    if throttle.should_emit(bytes) {
                        writer.flush().await?;
                        self.store
                            .update_progress(task_id, bytes, total_bytes, speed.average_speed())
                            .await?;
                    }
                }
            }
        }

        writer.flush().await?;
        self.store
            .update_progress(task_id, bytes, total_bytes, speed.average_speed())
            .await?;

        Ok(PumpEnd::Finished(bytes))
    }

    /// Sniff the payload, derive the final name, and move the artifact into
    /// place according to the configured save mode.
    async fn finalize(
        &self,
        task: &Task,
        part_path: &Path,
        content_type: Option<&str>,
    ) -> Result<PathBuf> {
        let mut head = [0u8; SNIFF_LEN];
        let read = {
            let mut file = File::open(part_path).await?;
            file.read(&mut head).await?
        };

        let format = sniff::resolve_format(&head[..read], content_type);
        let extension = match format {
            Some(format) => format.extension(),
            None => {
                debug!(task_id = %task.id, "payload format inconclusive, defaulting to mp3");
                "mp3"
            }
        };

        let destination = match self.config.save_mode {
            SaveMode::Silent => naming::output_path(
                &self.config.music_directory,
                &self.config.file_naming_template,
                &task.title,
                &task.artist,
                extension,
            ),
            SaveMode::Prompt => {
                let suggested = format!(
                    "{}.{}",
                    naming::render_template(
                        &self.config.file_naming_template,
                        &task.title,
                        &task.artist
                    ),
                    extension
                );
                self.locator
                    .as_ref()
                    .and_then(|locator| locator.locate(&suggested))
                    .ok_or_else(|| {
                        MelodownError::SaveFailed("no save location provided".to_string())
                    })?
            }
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MelodownError::SaveFailed(e.to_string()))?;
        }

        move_file(part_path, &destination)
            .await
            .map_err(|e| MelodownError::SaveFailed(e.to_string()))?;

        Ok(destination)
    }
}

enum StreamStart {
    Open {
        response: reqwest::Response,
        offset: u64,
    },
    Aborted(AbortReason),
    Ended(TransferEnd),
}

enum PumpEnd {
    Finished(u64),
    Stopped(TransferEnd),
}

/// Rename with a copy fallback for cross-filesystem destinations
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

/// Parse the total size out of `Content-Range: bytes 1000-1999/2000`
fn parse_content_range_total(response: &reqwest::Response) -> Result<u64> {
    let raw = response
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            MelodownError::InvalidState("partial response without Content-Range".to_string())
        })?;

    total_from_content_range(raw)
        .ok_or_else(|| MelodownError::InvalidState(format!("malformed Content-Range: {raw:?}")))
}

fn total_from_content_range(raw: &str) -> Option<u64> {
    raw.split('/').nth(1).and_then(|s| s.trim().parse::<u64>().ok())
}
