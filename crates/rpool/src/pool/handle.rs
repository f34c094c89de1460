//! PooledConnection - exclusive lease on one connection from a pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::PoolShared;
use crate::connection::{Connection, ConnectionId};
use crate::error::PoolError;

/// A connection checked out of a [`ConnectionPool`](super::ConnectionPool).
///
/// The lease is released exactly once: the first `release`/`discard` hands
/// the connection back, later calls are no-ops. Dropping an unreleased handle
/// checks it in.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    pub(super) fn new(conn: Box<dyn Connection>, pool: Arc<PoolShared>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// `None` once released.
    pub fn id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(|c| c.id())
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    pub(super) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    fn connection(&mut self) -> Result<&mut dyn Connection, PoolError> {
        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(PoolError::Released),
        }
    }

    /// Evaluate on the leased session.
    ///
    /// Only a severed transport ([`ConnectionError::TransportClosed`]) is
    /// reconnected and the call retried once. A remote error is returned
    /// as-is without a reset, so the variables a caller built up in this
    /// session survive a failing expression. This is narrower than the
    /// worker pool and the async bridge, which also reset and retry once on
    /// [`ConnectionError::Remote`].
    ///
    /// [`ConnectionError::TransportClosed`]: crate::ConnectionError::TransportClosed
    /// [`ConnectionError::Remote`]: crate::ConnectionError::Remote
    pub fn evaluate(&mut self, code: &str) -> Result<serde_json::Value, PoolError> {
        let conn = self.connection()?;
        match conn.evaluate(code) {
            Err(e) if e.is_transport() => {
                tracing::warn!(
                    connection = %conn.id(),
                    error = %e,
                    "Pooled connection lost transport, reconnecting"
                );
                conn.reset()?;
                Ok(conn.evaluate(code)?)
            }
            other => Ok(other?),
        }
    }

    pub fn reset(&mut self) -> Result<(), PoolError> {
        Ok(self.connection()?.reset()?)
    }

    pub fn working_directory(&mut self) -> Result<PathBuf, PoolError> {
        Ok(self.connection()?.working_directory()?)
    }

    /// Copy `source` into this session's working directory.
    pub fn upload(&mut self, source: &Path) -> Result<PathBuf, PoolError> {
        let conn = self.connection()?;
        let wd = conn.working_directory()?;
        Ok(conn.upload(source, &wd)?)
    }

    /// Check the connection back in. Idempotent.
    pub fn release(&mut self) -> Result<(), PoolError> {
        match self.conn.take() {
            Some(conn) => self.pool.return_connection(conn),
            None => Ok(()),
        }
    }

    /// Disconnect instead of checking in; the pool replaces it if needed.
    /// Idempotent.
    pub fn discard(&mut self) -> Result<(), PoolError> {
        match self.conn.take() {
            Some(conn) => self.pool.destroy_connection(conn),
            None => Ok(()),
        }
    }

    /// The engine is shared by every pooled session and may not be stopped
    /// through one of them.
    pub fn shutdown_engine(&self) -> Result<(), PoolError> {
        Err(PoolError::MethodNotAllowed(
            "shutting down the remote engine from a pooled connection",
        ))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let id = conn.id();
            if let Err(e) = self.pool.return_connection(conn) {
                tracing::warn!(connection = %id, error = %e, "Checkin on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}
