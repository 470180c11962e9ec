use std::time::Duration;

use thiserror::Error;

/// Failure of a single measurement tool invocation.
///
/// Never escapes the runner: every variant is turned into a published
/// `MeasurementError` whose level comes from [`RunnerError::level`].
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The executable could not be started (missing, not executable).
    #[error("Failed to start '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the output or waiting for the process failed.
    #[error("IO error while running measurement: {0}")]
    Io(#[from] std::io::Error),

    #[error("Measurement did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Tool output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Malformed JSON or a required key is missing.
    #[error("Malformed tool output: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Severity published in the error attributes.
    pub fn level(&self) -> &'static str {
        match self {
            RunnerError::Spawn { .. } | RunnerError::Io(_) | RunnerError::Timeout(_) => "fatal",
            RunnerError::Utf8(_) | RunnerError::Json(_) => "parse_error",
        }
    }
}
