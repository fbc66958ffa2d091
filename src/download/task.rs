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


//! Task and progress records
//!
//! A [`Task`] is one user-requested download of a track at a given quality.
//! The byte-level transfer state lives in a separate [`Progress`] record so
//! that consumers watching task metadata are not churned by per-chunk
//! updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MelodownError, Result};

/// Requested audio quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    /// 128 kbps
    #[serde(rename = "128")]
    Low,
    /// 192 kbps
    #[serde(rename = "192")]
    Standard,
    /// 320 kbps
    #[serde(rename = "320")]
    High,
    /// FLAC
    #[serde(rename = "flac")]
    Lossless,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "128",
            Quality::Standard => "192",
            Quality::High => "320",
            Quality::Lossless => "flac",
        }
    }

    /// Nominal payload rate in bytes per second, used for size estimation
    /// before the resolver has answered. FLAC is taken at ~1000 kbps.
    pub fn bytes_per_second(&self) -> u64 {
        match self {
            Quality::Low => 128_000 / 8,
            Quality::Standard => 192_000 / 8,
            Quality::High => 320_000 / 8,
            Quality::Lossless => 1_000_000 / 8,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = MelodownError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "128" => Ok(Quality::Low),
            "192" => Ok(Quality::Standard),
            "320" => Ok(Quality::High),
            "flac" => Ok(Quality::Lossless),
            _ => Err(MelodownError::UnknownQuality(s.to_string())),
        }
    }
}

/// Status of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "downloading" => Ok(TaskStatus::Downloading),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "error" => Ok(TaskStatus::Error),
            _ => Err(MelodownError::InvalidState(format!(
                "unknown task status: {}",
                s
            ))),
        }
    }

    /// Terminal statuses end a task's lifecycle until an explicit retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

/// Track metadata supplied by the caller when enqueueing a download.
///
/// `duration_secs` is the locally-known play length used for the initial
/// size estimate; the resolver refines it once the server answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackMeta {
    pub resource_id: String,
    pub title: String,
    pub artist: String,
    pub duration_secs: u64,
}

/// Download task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub resource_id: String,
    pub title: String,
    pub artist: String,
    pub requested_quality: Quality,
    pub actual_quality: Option<Quality>,
    pub was_downgraded: bool,
    pub status: TaskStatus,
    pub error: Option<String>,
    /// Size guess from local metadata, until `total_bytes` is authoritative
    pub file_size_estimate: u64,
    /// Authoritative size once known; 0 while unknown
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic admission order, drives FIFO scheduling
    pub seq: u64,
}

impl Task {
    pub fn new(meta: &TrackMeta, quality: Quality, seq: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: meta.resource_id.clone(),
            title: meta.title.clone(),
            artist: meta.artist.clone(),
            requested_quality: quality,
            actual_quality: None,
            was_downgraded: false,
            status: TaskStatus::Pending,
            error: None,
            file_size_estimate: meta.duration_secs * quality.bytes_per_second(),
            total_bytes: 0,
            created_at: Utc::now(),
            completed_at: None,
            seq,
        }
    }

    /// Display name shown in queue listings
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Quality actually being transferred, once resolution has run
    pub fn effective_quality(&self) -> Quality {
        self.actual_quality.unwrap_or(self.requested_quality)
    }
}

/// Byte-level transfer state for a task, kept apart from [`Task`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub bytes_loaded: u64,
    pub total_bytes: u64,
    /// Smoothed throughput in bytes per second
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
    pub last_update: DateTime<Utc>,
}

impl Progress {
    pub fn new(bytes_loaded: u64, total_bytes: u64) -> Self {
        Self {
            bytes_loaded,
            total_bytes,
            speed_bps: 0.0,
            eta_seconds: None,
            last_update: Utc::now(),
        }
    }

    /// Percentage complete (0.0 - 100.0), 0 while the total is unknown
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_loaded as f64 / self.total_bytes as f64) * 100.0
    }
}
