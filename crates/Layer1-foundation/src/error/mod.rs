//! Error types for the task manager
//!
//! Synchronous API failures are returned as [`Error`]; asynchronous job
//! failures are recorded on the task record instead.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Task manager error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Task lifecycle
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Process launch failed: {0}")]
    ProcessLaunch(String),

    #[error("Remote dispatch failed: {host} - {message}")]
    RemoteDispatch { host: String, message: String },

    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // External error conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that are the caller's fault and safe to show as-is
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::InvalidState(_))
    }

    /// Remote dispatch error helper
    pub fn remote_dispatch(host: impl Into<String>, message: impl Into<String>) -> Self {
        Error::RemoteDispatch {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Not-found error for a task ID
    pub fn task_not_found(task_id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("task {} not found", task_id))
    }
}
