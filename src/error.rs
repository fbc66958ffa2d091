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


//! Error types for the download-queue core
//!
//! One `thiserror` enum for the whole crate, categorized by domain
//! (resolution, transport, storage, task-store misuse). The transfer engine
//! never lets any of these escape to the scheduler; they are folded into a
//! transfer outcome and, where user-visible, projected through
//! [`MelodownError::user_message`].

use thiserror::Error;

/// Result type alias using our MelodownError type
pub type Result<T> = std::result::Result<T, MelodownError>;

/// Main error type for melodown
#[derive(Error, Debug)]
pub enum MelodownError {
    // ===== Resolution Errors =====

    /// The lookup API answered but refused the request (quality not entitled,
    /// region lock, taken down). Never retried.
    #[error("resource unavailable: {message}")]
    ResourceUnavailable { message: String },

    /// The lookup API returned a payload we could not make sense of
    #[error("invalid lookup response: {0}")]
    InvalidLookupResponse(String),

    // ===== Transport Errors =====

    /// Network connectivity error
    #[error("network error: {message}")]
    Network {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// No bytes arrived within the per-task inactivity window
    #[error("transfer stalled: no data received for {0} seconds")]
    InactivityTimeout(u64),

    /// Server responded with a status the transfer path cannot use
    #[error("server responded with unexpected status code: {status}")]
    UnexpectedStatus { status: u16 },

    /// Resumed transfer reported a different total size than we recorded
    #[error("content length mismatch: expected {expected} bytes, got {actual}")]
    ContentLengthMismatch { expected: u64, actual: u64 },

    // ===== Task Store Errors =====

    /// Task id is not present in the store
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Operation is not valid for the task's current status
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Requested quality string is not one we know
    #[error("unknown quality: {0}")]
    UnknownQuality(String),

    // ===== Persistence Errors =====

    /// Moving the finished file to its destination failed or was declined
    #[error("failed to save completed file: {0}")]
    SaveFailed(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Database driver error from sqlx
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MelodownError {
    /// Whether this error might succeed if the same operation is retried.
    ///
    /// The resolver uses this to decide between waiting and giving up;
    /// explicit application-level refusals are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            MelodownError::Network { is_transient, .. } => *is_transient,
            MelodownError::InactivityTimeout(_) => true,
            MelodownError::UnexpectedStatus { status } => (500..=599).contains(status),
            MelodownError::Reqwest(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// User-appropriate error message.
    ///
    /// Raw transport/database detail goes to the log, not the task's error
    /// field; messages the server intended for users pass through verbatim.
    pub fn user_message(&self) -> String {
        match self {
            MelodownError::ResourceUnavailable { message } => message.clone(),
            MelodownError::Network { .. } => {
                "Network error while downloading. The download can be resumed.".to_string()
            }
            MelodownError::InactivityTimeout(secs) => {
                format!("The download stalled (no data for {}s) and was stopped.", secs)
            }
            MelodownError::UnexpectedStatus { status } => {
                format!("The server rejected the download (HTTP {}).", status)
            }
            MelodownError::SaveFailed(reason) => {
                format!("Could not save the finished file: {}", reason)
            }
            _ => self.to_string(),
        }
    }

    /// Shorthand for a transient network error
    pub fn network<S: Into<String>>(message: S, is_transient: bool) -> Self {
        MelodownError::Network {
            message: message.into(),
            is_transient,
        }
    }
}
