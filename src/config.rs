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


//! Download queue configuration
//!
//! The core only reads this configuration; where the values come from
//! (settings UI, config file, defaults) is the embedder's concern.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::download::task::Quality;

/// How finished files reach their final location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Rename into `music_directory` without asking
    Silent,
    /// Ask the embedder-supplied [`crate::file::SaveLocator`] for a target path
    Prompt,
}

/// Download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum concurrent downloads (the scheduler may lower, never raise,
    /// the effective budget under backend load)
    pub max_concurrent: usize,

    /// Directory for in-flight `.part` files
    pub staging_directory: PathBuf,

    /// Destination directory for silent saves
    pub music_directory: PathBuf,

    /// Silent default-location save, or prompt-for-location
    pub save_mode: SaveMode,

    /// File naming template (e.g., "{artist} - {title}")
    pub file_naming_template: String,

    /// Minimum interval between progress-record writes
    pub progress_interval: Duration,

    /// Byte quantum that also forces a progress write
    pub progress_byte_quantum: u64,

    /// Inactivity timeout for standard-bitrate transfers
    pub standard_inactivity_timeout: Duration,

    /// Inactivity timeout for lossless transfers (larger payloads, slower
    /// CDN edges)
    pub lossless_inactivity_timeout: Duration,

    /// How often the backend load monitor is sampled while transfers run
    pub load_sample_interval: Duration,

    /// Retry bound for the resolution step (transient failures only)
    pub resolve_retries: u32,

    /// Fixed delay between resolution attempts
    pub resolve_retry_delay: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            staging_directory: PathBuf::from("."),
            music_directory: PathBuf::from("."),
            save_mode: SaveMode::Silent,
            file_naming_template: "{artist} - {title}".to_string(),
            progress_interval: Duration::from_millis(500),
            progress_byte_quantum: 64 * 1024,
            standard_inactivity_timeout: Duration::from_secs(30),
            lossless_inactivity_timeout: Duration::from_secs(90),
            load_sample_interval: Duration::from_secs(60),
            resolve_retries: 2,
            resolve_retry_delay: Duration::from_millis(800),
        }
    }
}

impl DownloadConfig {
    /// Staging path for a task's partial bytes
    pub fn part_path(&self, task_id: &str) -> PathBuf {
        self.staging_directory.join(format!("{}.part", task_id))
    }

    /// Inactivity timeout for the given quality tier
    pub fn inactivity_timeout(&self, quality: Quality) -> Duration {
        if quality == Quality::Lossless {
            self.lossless_inactivity_timeout
        } else {
            self.standard_inactivity_timeout
        }
    }
}
