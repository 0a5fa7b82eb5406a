/*!
 * Error types for the fluentai runtime core.
 *
 * Every failure the core can surface is one variant of `RuntimeError`. The
 * variants keep the distinction between failures that already triggered a
 * restart of the affected decoder (the caller may retry) and failures the
 * caller has to fix before trying again.
 */

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by decoder runtimes, the runtime cache and the controller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Model directory or one of the required model files is missing
    #[error("Model files not found: {0}")]
    NotFound(String),

    /// The decoder process could not be spawned or exited right after spawn
    #[error("Decoder for {key} failed to start: {message}")]
    StartupFailure {
        /// Language pair key of the runtime
        key: String,
        /// Captured standard error of the decoder, or the spawn error
        message: String,
    },

    /// No response line arrived before the call deadline; the runtime was restarted
    #[error("Decoder for {key} did not respond within {seconds}s")]
    Timeout {
        /// Language pair key of the runtime
        key: String,
        /// Deadline that was exceeded
        seconds: u64,
    },

    /// I/O error or unexpected decoder exit in the middle of a call
    #[error("Decoder runtime error for {key}: {message}")]
    RuntimeFailure {
        /// Language pair key of the runtime
        key: String,
        /// What went wrong
        message: String,
    },

    /// Unsupported or malformed language code
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Explicit load of a runtime that is already cached
    #[error("Runtime {0} is already loaded")]
    AlreadyLoaded(String),
}

impl RuntimeError {
    /// HTTP-class status code a front end should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidRequest(_) | Self::AlreadyLoaded(_) => 400,
            Self::StartupFailure { .. } | Self::Timeout { .. } | Self::RuntimeFailure { .. } => 500,
        }
    }

    /// Whether the runtime already recovered and the same request may be sent again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RuntimeFailure { .. })
    }

    /// Short kind name used in error bodies
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::StartupFailure { .. } => "StartupFailure",
            Self::Timeout { .. } => "Timeout",
            Self::RuntimeFailure { .. } => "RuntimeFailure",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::AlreadyLoaded(_) => "AlreadyLoaded",
        }
    }
}

/// JSON error body for front ends that expose the core over HTTP
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorResponse {
    /// Always "error"
    pub status: String,
    /// Error kind name
    pub error: String,
    /// Human readable message
    pub message: String,
    /// UTC timestamp in RFC 3339 format
    pub timestamp: String,
}

impl From<&RuntimeError> for ErrorResponse {
    fn from(error: &RuntimeError) -> Self {
        Self {
            status: "error".to_string(),
            error: error.kind_name().to_string(),
            message: error.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
