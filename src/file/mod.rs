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


//! File typing and naming for finished downloads

pub mod naming;
pub mod sniff;

use std::path::PathBuf;

pub use sniff::AudioFormat;

/// Supplies a save location when the queue runs in
/// [`crate::config::SaveMode::Prompt`] mode.
///
/// Implemented by the embedder (typically a file dialog). Returning `None`
/// declines the save and fails the task.
pub trait SaveLocator: Send + Sync {
    fn locate(&self, suggested_name: &str) -> Option<PathBuf>;
}
