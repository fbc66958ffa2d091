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


//! Output file naming
//!
//! Template variables: `{title}`, `{artist}`. Names are sanitized for
//! filesystem compatibility and collisions are avoided by appending a
//! counter.

use std::path::{Path, PathBuf};

/// Render a naming template into a filename stem (no extension)
pub fn render_template(template: &str, title: &str, artist: &str) -> String {
    let rendered = template
        .replace("{title}", &sanitize_filename(title))
        .replace("{artist}", &sanitize_filename(artist));

    let trimmed = rendered.trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitize a filename component by replacing invalid characters
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
    name.chars()
        .map(|c| {
            if invalid_chars.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Avoid filename collisions by appending (1), (2), etc.
pub fn avoid_collision(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled");
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    for i in 1..1000 {
        let candidate = if extension.is_empty() {
            format!("{} ({})", stem, i)
        } else {
            format!("{} ({}).{}", stem, i, extension)
        };

        let candidate_path = parent.join(candidate);
        if !candidate_path.exists() {
            return candidate_path;
        }
    }

    path // Give up after 1000 attempts
}

/// Full output path for a finished track
pub fn output_path(
    directory: &Path,
    template: &str,
    title: &str,
    artist: &str,
    extension: &str,
) -> PathBuf {
    let mut filename = render_template(template, title, artist);
    filename.push('.');
    filename.push_str(extension);
    avoid_collision(directory.join(filename))
}
