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


//! Database connection and schema management
//!
//! SQLite via sqlx, WAL mode for concurrent readers, foreign keys on.
//! The schema holds task metadata and the high-frequency progress rows in
//! separate tables, mirroring the in-memory split.

use crate::error::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    ConnectOptions,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Database manager - handles connection pooling and schema setup
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>, // None for in-memory databases
}

impl Database {
    /// Open (creating if missing) a database file and run migrations
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let path = database_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connection_string = format!("sqlite://{}?mode=rwc", path.display());
        let connect_opts = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_opts)
            .await?;

        let db = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        db.migrate().await?;

        Ok(db)
    }

    /// Create in-memory database for testing
    pub async fn new_in_memory() -> Result<Self> {
        let connect_opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // In-memory DB lives in a single connection
            .connect_with(connect_opts)
            .await?;

        let db = Self { pool, path: None };
        db.migrate().await?;

        Ok(db)
    }

    /// Create the download tables if they do not exist
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS DownloadTasks (
                task_id            TEXT PRIMARY KEY,
                resource_id        TEXT NOT NULL,
                title              TEXT NOT NULL,
                artist             TEXT NOT NULL,
                requested_quality  TEXT NOT NULL,
                actual_quality     TEXT,
                was_downgraded     INTEGER NOT NULL DEFAULT 0,
                status             TEXT NOT NULL,
                error              TEXT,
                file_size_estimate INTEGER NOT NULL DEFAULT 0,
                total_bytes        INTEGER NOT NULL DEFAULT 0,
                seq                INTEGER NOT NULL,
                created_at         TEXT NOT NULL,
                completed_at       TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS TaskProgress (
                task_id      TEXT PRIMARY KEY
                             REFERENCES DownloadTasks(task_id) ON DELETE CASCADE,
                bytes_loaded INTEGER NOT NULL,
                total_bytes  INTEGER NOT NULL,
                speed_bps    REAL NOT NULL DEFAULT 0,
                eta_seconds  INTEGER,
                last_update  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
