//! The capability consumed from the remote-execution collaborator.
//!
//! A [`Connection`] is an exclusive, stateful session to a single-threaded
//! engine. Exclusivity is carried by ownership: every owner (a pooled handle,
//! a worker thread, an affinity slot) holds a `Box<dyn Connection>` and only
//! ever lends it out as `&mut`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Connected,
    /// The transport failed; the next use must reconnect.
    Broken,
    Closed,
}

/// An exclusive session to the remote engine.
pub trait Connection: Send {
    fn id(&self) -> ConnectionId;

    fn state(&self) -> ConnectionState;

    /// Evaluate `code` and return the engine's result.
    fn evaluate(&mut self, code: &str) -> Result<serde_json::Value, ConnectionError>;

    /// Tear the session down and establish a fresh one, discarding all state.
    fn reset(&mut self) -> Result<(), ConnectionError>;

    /// Release the underlying resource. Idempotent.
    fn close(&mut self);

    fn working_directory(&mut self) -> Result<PathBuf, ConnectionError>;

    /// Place `source` into `destination_dir`, returning the new path.
    ///
    /// Assumes the engine shares the local filesystem.
    fn upload(
        &mut self,
        source: &Path,
        destination_dir: &Path,
    ) -> Result<PathBuf, ConnectionError> {
        let name = source.file_name().ok_or_else(|| {
            ConnectionError::Upload(format!("{} has no file name", source.display()))
        })?;
        let target = destination_dir.join(name);
        std::fs::copy(source, &target).map_err(|e| {
            ConnectionError::Upload(format!(
                "{} -> {}: {e}",
                source.display(),
                target.display()
            ))
        })?;
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "Uploaded support file"
        );
        Ok(target)
    }
}

/// Creates connected sessions. Holds whatever arguments the engine needs.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Result<Box<dyn Connection>, ConnectionError> + Send + Sync,
{
    fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        self()
    }
}

/// Shared handle to a factory.
pub type SharedFactory = Arc<dyn ConnectionFactory>;

/// One-time preparation of a freshly established session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionSetup {
    /// Files copied into the session's working directory.
    #[serde(default)]
    pub support_files: Vec<PathBuf>,

    /// Code evaluated once, after the support files are in place.
    #[serde(default)]
    pub initializer: Option<String>,
}

impl SessionSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_support_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.support_files.push(path.into());
        self
    }

    pub fn with_initializer(mut self, code: impl Into<String>) -> Self {
        self.initializer = Some(code.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.support_files.is_empty() && self.initializer.is_none()
    }

    /// Upload support files, then run the initializer.
    pub fn prepare(&self, conn: &mut dyn Connection) -> Result<(), ConnectionError> {
        if !self.support_files.is_empty() {
            let wd = conn.working_directory()?;
            for file in &self.support_files {
                conn.upload(file, &wd)?;
            }
        }

        if let Some(ref initializer) = self.initializer {
            conn.evaluate(initializer)?;
            tracing::debug!(connection = %conn.id(), "Session initializer evaluated");
        }

        Ok(())
    }
}

/// Evaluate with exactly one reset-and-retry on a recoverable failure.
pub fn evaluate_with_retry(
    conn: &mut dyn Connection,
    code: &str,
) -> Result<serde_json::Value, ConnectionError> {
    match conn.evaluate(code) {
        Err(e) if e.is_recoverable() => {
            tracing::warn!(
                connection = %conn.id(),
                error = %e,
                "Evaluation failed, resetting and retrying once"
            );
            conn.reset()?;
            conn.evaluate(code)
        }
        other => other,
    }
}
