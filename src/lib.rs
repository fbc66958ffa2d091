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


//! Download-queue core for the Melodown music player.
//!
//! A concurrent task scheduler that fetches remote audio streams with
//! pause/resume/cancel, byte-range resumption across restarts, adaptive
//! concurrency, throughput estimation, and crash recovery via persisted
//! state. Presentation layers drive it through [`DownloadQueue`] and react
//! to [`QueueEvent`] notifications.

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod file;
pub mod storage;

pub use api::resolver::{HttpResolver, ResolvedSource, ResourceResolver};
pub use config::{DownloadConfig, SaveMode};
pub use download::{
    DownloadQueue, LoadMonitor, Progress, Quality, QueueBuilder, Task, TaskStatus, TrackMeta,
    TransferOutcome,
};
pub use error::{MelodownError, Result};
pub use events::QueueEvent;
