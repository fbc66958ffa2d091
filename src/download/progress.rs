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


//! Throughput measurement and progress-update throttling
//!
//! - Speed is a moving average over a sliding window, so per-chunk jitter
//!   does not whipsaw the UI.
//! - Progress writes are throttled by time *or* byte quantum, never emitted
//!   per chunk.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default averaging window
const SPEED_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,
    position: u64,
}

/// Moving-average download speed tracker
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,
    window: Duration,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::with_window(SPEED_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Record the total byte position at this instant
    pub fn add_position(&mut self, position: u64) {
        let now = Instant::now();
        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.timestamp) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average speed across the window, in bytes per second
    pub fn average_speed(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        // len() >= 2 checked above
        let first = self.samples.front().expect("non-empty samples");
        let last = self.samples.back().expect("non-empty samples");

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimate seconds remaining from speed and remaining bytes.
///
/// Returns `None` while the total is unknown or the line is idle; speeds
/// under 1 B/s are treated as idle to avoid absurd estimates.
pub fn estimate_eta(bytes_loaded: u64, total_bytes: u64, speed_bps: f64) -> Option<u64> {
    if total_bytes == 0 || speed_bps < 1.0 {
        return None;
    }
    let remaining = total_bytes.saturating_sub(bytes_loaded);
    Some((remaining as f64 / speed_bps).round() as u64)
}

/// Decides when a progress update is worth propagating.
///
/// Fires when either the configured interval has elapsed or the byte quantum
/// has accumulated since the last emission.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    byte_quantum: u64,
    last_emit: Instant,
    last_bytes: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, byte_quantum: u64) -> Self {
        Self {
            interval,
            byte_quantum,
            last_emit: Instant::now(),
            last_bytes: 0,
        }
    }

    /// Start accounting from a resume offset instead of zero
    pub fn reset_to(&mut self, bytes: u64) {
        self.last_emit = Instant::now();
        self.last_bytes = bytes;
    }

    /// Returns true if an update should be emitted at this byte position
    pub fn should_emit(&mut self, bytes: u64) -> bool {
        let elapsed = self.last_emit.elapsed() >= self.interval;
        let quantum = bytes.saturating_sub(self.last_bytes) >= self.byte_quantum;
        if elapsed || quantum {
            self.last_emit = Instant::now();
            self.last_bytes = bytes;
            true
        } else {
            false
        }
    }
}
