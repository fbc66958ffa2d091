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


//! Durable task/progress persistence
//!
//! The task store writes through a [`StateStore`] so the in-memory
//! representation stays decoupled from storage. Only Task and Progress
//! records are persisted; active transfer handles are inherently
//! non-serializable and never touch this layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use crate::download::task::{Progress, Quality, Task, TaskStatus};
use crate::error::{MelodownError, Result};

/// A task plus its progress record, as loaded at startup
#[derive(Debug, Clone)]
pub struct PersistedTask {
    pub task: Task,
    pub progress: Option<Progress>,
}

/// Key-value persistence for Task/Progress records, surviving restarts
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load every persisted task (with progress where present)
    async fn load_all(&self) -> Result<Vec<PersistedTask>>;

    /// Insert or replace a task record
    async fn upsert_task(&self, task: &Task) -> Result<()>;

    /// Insert or replace a task's progress record
    async fn upsert_progress(&self, task_id: &str, progress: &Progress) -> Result<()>;

    /// Delete a task's progress record (cancel/retry/completion)
    async fn clear_progress(&self, task_id: &str) -> Result<()>;

    /// Delete a task and its progress record
    async fn remove(&self, task_id: &str) -> Result<()>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

/// [`StateStore`] backed by the crate's SQLite database
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
        let requested: String = row.try_get("requested_quality")?;
        let actual: Option<String> = row.try_get("actual_quality")?;
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;

        Ok(Task {
            id: row.try_get("task_id")?,
            resource_id: row.try_get("resource_id")?,
            title: row.try_get("title")?,
            artist: row.try_get("artist")?,
            requested_quality: Quality::from_str(&requested)?,
            actual_quality: actual.as_deref().map(Quality::from_str).transpose()?,
            was_downgraded: row.try_get::<i64, _>("was_downgraded")? != 0,
            status: TaskStatus::parse(&status)?,
            error: row.try_get("error")?,
            file_size_estimate: row.try_get::<i64, _>("file_size_estimate")? as u64,
            total_bytes: row.try_get::<i64, _>("total_bytes")? as u64,
            seq: row.try_get::<i64, _>("seq")? as u64,
            created_at: parse_timestamp(&created_at)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    fn row_to_progress(row: &sqlx::sqlite::SqliteRow) -> Result<Progress> {
        let last_update: String = row.try_get("last_update")?;
        let eta: Option<i64> = row.try_get("eta_seconds")?;

        Ok(Progress {
            bytes_loaded: row.try_get::<i64, _>("bytes_loaded")? as u64,
            total_bytes: row.try_get::<i64, _>("total_bytes")? as u64,
            speed_bps: row.try_get("speed_bps")?,
            eta_seconds: eta.map(|v| v as u64),
            last_update: parse_timestamp(&last_update)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MelodownError::InvalidState(format!("bad stored timestamp {s:?}: {e}")))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_all(&self) -> Result<Vec<PersistedTask>> {
        let task_rows = sqlx::query("SELECT * FROM DownloadTasks ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;

        let progress_rows = sqlx::query("SELECT * FROM TaskProgress")
            .fetch_all(&self.pool)
            .await?;

        let mut progress_by_id: HashMap<String, Progress> = HashMap::new();
        for row in &progress_rows {
            let id: String = row.try_get("task_id")?;
            progress_by_id.insert(id, Self::row_to_progress(row)?);
        }

        task_rows
            .iter()
            .map(|row| {
                let task = Self::row_to_task(row)?;
                let progress = progress_by_id.remove(&task.id);
                Ok(PersistedTask { task, progress })
            })
            .collect()
    }

    async fn upsert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO DownloadTasks (
                task_id, resource_id, title, artist, requested_quality,
                actual_quality, was_downgraded, status, error,
                file_size_estimate, total_bytes, seq, created_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                actual_quality = excluded.actual_quality,
                was_downgraded = excluded.was_downgraded,
                status = excluded.status,
                error = excluded.error,
                file_size_estimate = excluded.file_size_estimate,
                total_bytes = excluded.total_bytes,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.resource_id)
        .bind(&task.title)
        .bind(&task.artist)
        .bind(task.requested_quality.as_str())
        .bind(task.actual_quality.map(|q| q.as_str()))
        .bind(task.was_downgraded as i64)
        .bind(task.status.as_str())
        .bind(&task.error)
        .bind(task.file_size_estimate as i64)
        .bind(task.total_bytes as i64)
        .bind(task.seq as i64)
        .bind(task.created_at.to_rfc3339())
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_progress(&self, task_id: &str, progress: &Progress) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO TaskProgress (task_id, bytes_loaded, total_bytes, speed_bps, eta_seconds, last_update)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                bytes_loaded = excluded.bytes_loaded,
                total_bytes = excluded.total_bytes,
                speed_bps = excluded.speed_bps,
                eta_seconds = excluded.eta_seconds,
                last_update = excluded.last_update
            "#,
        )
        .bind(task_id)
        .bind(progress.bytes_loaded as i64)
        .bind(progress.total_bytes as i64)
        .bind(progress.speed_bps)
        .bind(progress.eta_seconds.map(|v| v as i64))
        .bind(progress.last_update.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_progress(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM TaskProgress WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM TaskProgress WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM DownloadTasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation (tests, ephemeral embedders)
// ============================================================================

/// [`StateStore`] that keeps everything in a process-local map
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<String, PersistedTask>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_all(&self) -> Result<Vec<PersistedTask>> {
        let inner = self.inner.lock().expect("state store lock poisoned");
        let mut all: Vec<PersistedTask> = inner.values().cloned().collect();
        all.sort_by_key(|p| p.task.seq);
        Ok(all)
    }

    async fn upsert_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        inner
            .entry(task.id.clone())
            .and_modify(|p| p.task = task.clone())
            .or_insert_with(|| PersistedTask {
                task: task.clone(),
                progress: None,
            });
        Ok(())
    }

    async fn upsert_progress(&self, task_id: &str, progress: &Progress) -> Result<()> {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        if let Some(entry) = inner.get_mut(task_id) {
            entry.progress = Some(progress.clone());
        }
        Ok(())
    }

    async fn clear_progress(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        if let Some(entry) = inner.get_mut(task_id) {
            entry.progress = None;
        }
        Ok(())
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        inner.remove(task_id);
        Ok(())
    }
}
