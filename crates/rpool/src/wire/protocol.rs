//! Messages exchanged with an engine process.
//!
//! The engine reads one [`EngineRequest`] at a time from its stdin and writes
//! exactly one [`EngineResponse`] to its stdout before reading the next.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineRequest {
    /// Evaluate `code` in the session and answer with its value.
    Eval { code: String },

    /// Report the session's working directory.
    WorkingDirectory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineResponse {
    Value { value: serde_json::Value },

    /// Evaluation failed inside the engine. The session is still usable.
    Error { message: String },

    WorkingDirectory { path: PathBuf },
}

impl EngineResponse {
    pub fn into_value(self) -> Result<serde_json::Value, ConnectionError> {
        match self {
            Self::Value { value } => Ok(value),
            Self::Error { message } => Err(ConnectionError::Remote(message)),
            other => Err(ConnectionError::Protocol(format!(
                "expected a value, got {other:?}"
            ))),
        }
    }

    pub fn into_working_directory(self) -> Result<PathBuf, ConnectionError> {
        match self {
            Self::WorkingDirectory { path } => Ok(path),
            Self::Error { message } => Err(ConnectionError::Remote(message)),
            other => Err(ConnectionError::Protocol(format!(
                "expected a working directory, got {other:?}"
            ))),
        }
    }
}
