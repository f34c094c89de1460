//! Bounded pool of idle connections with exclusive checkout.
//!
//! A connection is always in exactly one place: the idle set, a
//! [`PooledConnection`] handle, or destroyed. Only the membership bookkeeping
//! is locked; resets, connects and closes happen outside the lock.
//!
//! - `checkout` pops an idle connection or, if overflow allows, creates one.
//! - `checkin` resets (unless realtime) and returns it to idle, or destroys it
//!   when the idle set is already at `pool_size`.
//! - `close` destroys it and restores the idle set to `pool_size`.

mod handle;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{MaxOverflow, PoolConfig};
use crate::connection::{Connection, SharedFactory};
use crate::error::PoolError;

pub use handle::PooledConnection;

/// Point-in-time view of pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub max_overflow: MaxOverflow,
    pub idle: usize,
    pub checked_out: usize,
}

struct Members {
    idle: Vec<Box<dyn Connection>>,
    /// Includes connections in transit back to idle.
    checked_out: usize,
    closed: bool,
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    factory: SharedFactory,
    members: Mutex<Members>,
}

impl PoolShared {
    /// Checkin path shared by `PooledConnection::release` and its `Drop`.
    fn return_connection(&self, mut conn: Box<dyn Connection>) -> Result<(), PoolError> {
        if !self.has_idle_room() {
            self.members.lock().checked_out -= 1;
            conn.close();
            tracing::debug!(connection = %conn.id(), "Discarded overflow connection on checkin");
            return Ok(());
        }

        let reset = if self.config.realtime {
            Ok(())
        } else {
            conn.reset()
        };

        if let Err(e) = reset {
            tracing::warn!(
                connection = %conn.id(),
                error = %e,
                "Reset on checkin failed, replacing connection"
            );
            conn.close();
            self.members.lock().checked_out -= 1;
            if let Err(replace_err) = self.replenish() {
                tracing::error!(error = %replace_err, "Failed to replace connection");
            }
            return Err(e.into());
        }

        let mut members = self.members.lock();
        members.checked_out -= 1;
        if !members.closed && members.idle.len() < self.config.pool_size {
            members.idle.push(conn);
            return Ok(());
        }
        drop(members);

        conn.close();
        tracing::debug!(
            connection = %conn.id(),
            "Idle set filled during checkin, discarded connection"
        );
        Ok(())
    }

    /// Close path shared by `ConnectionPool::close` and `PooledConnection::discard`.
    fn destroy_connection(&self, mut conn: Box<dyn Connection>) -> Result<(), PoolError> {
        conn.close();
        self.members.lock().checked_out -= 1;
        tracing::debug!(connection = %conn.id(), "Closed pooled connection");
        self.replenish()
    }

    fn has_idle_room(&self) -> bool {
        let members = self.members.lock();
        !members.closed && members.idle.len() < self.config.pool_size
    }

    /// Create one replacement if the idle set is below `pool_size`.
    fn replenish(&self) -> Result<(), PoolError> {
        if !self.has_idle_room() {
            return Ok(());
        }

        let mut conn = self.factory.connect()?;

        let mut members = self.members.lock();
        if !members.closed && members.idle.len() < self.config.pool_size {
            tracing::debug!(connection = %conn.id(), "Replenished idle connection");
            members.idle.push(conn);
            return Ok(());
        }
        drop(members);
        conn.close();
        Ok(())
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let members = self.members.get_mut();
        for conn in members.idle.iter_mut() {
            conn.close();
        }
        members.idle.clear();
    }
}

/// Bounded pool of idle connections.
///
/// Cheap to clone; clones share the same membership.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create the pool, eagerly connecting `pool_size` sessions.
    pub fn new(config: PoolConfig, factory: SharedFactory) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let mut idle: Vec<Box<dyn Connection>> = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            match factory.connect() {
                Ok(conn) => idle.push(conn),
                Err(e) => {
                    for mut conn in idle {
                        conn.close();
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            pool_size = config.pool_size,
            max_overflow = ?config.max_overflow,
            realtime = config.realtime,
            "Connection pool initialized"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                factory,
                members: Mutex::new(Members {
                    idle,
                    checked_out: 0,
                    closed: false,
                }),
            }),
        })
    }

    /// Take exclusive use of a connection. Never blocks waiting for one.
    pub fn checkout(&self) -> Result<PooledConnection, PoolError> {
        {
            let mut members = self.shared.members.lock();
            if members.closed {
                return Err(PoolError::Closed);
            }
            if let Some(limit) = self.shared.config.capacity()
                && members.checked_out >= limit
            {
                return Err(PoolError::ResourceExhausted { limit });
            }

            members.checked_out += 1;
            if let Some(conn) = members.idle.pop() {
                drop(members);
                return Ok(PooledConnection::new(conn, Arc::clone(&self.shared)));
            }
        }

        // Idle set empty: the slot is reserved, connect outside the lock.
        match self.shared.factory.connect() {
            Ok(conn) => {
                tracing::debug!(connection = %conn.id(), "Created overflow connection");
                Ok(PooledConnection::new(conn, Arc::clone(&self.shared)))
            }
            Err(e) => {
                self.shared.members.lock().checked_out -= 1;
                Err(e.into())
            }
        }
    }

    /// Return a connection. Resets it first unless the pool is realtime.
    pub fn checkin(&self, mut handle: PooledConnection) -> Result<(), PoolError> {
        self.ensure_owned(&handle)?;
        handle.release()
    }

    /// Disconnect the handle's connection and restore the idle set to
    /// `pool_size` before returning.
    pub fn close(&self, mut handle: PooledConnection) -> Result<(), PoolError> {
        self.ensure_owned(&handle)?;
        handle.discard()
    }

    /// Hard-kill a checked-out connection. Not supported: the handle is left
    /// untouched and still owned by the caller.
    pub fn terminate(&self, handle: &mut PooledConnection) -> Result<(), PoolError> {
        self.ensure_owned(handle)?;
        Err(PoolError::Unsupported("terminate"))
    }

    /// Checkout, evaluate, checkin.
    pub fn eval(&self, code: &str) -> Result<serde_json::Value, PoolError> {
        let mut handle = self.checkout()?;
        let result = handle.evaluate(code);
        let released = handle.release();
        let value = result?;
        released?;
        Ok(value)
    }

    pub fn status(&self) -> PoolStatus {
        let members = self.shared.members.lock();
        PoolStatus {
            pool_size: self.shared.config.pool_size,
            max_overflow: self.shared.config.max_overflow,
            idle: members.idle.len(),
            checked_out: members.checked_out,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Close every idle connection and refuse further checkouts. Handles
    /// still out are destroyed when they come back.
    pub fn shutdown(&self) {
        let idle = {
            let mut members = self.shared.members.lock();
            members.closed = true;
            std::mem::take(&mut members.idle)
        };
        let count = idle.len();
        for mut conn in idle {
            conn.close();
        }
        tracing::info!(closed = count, "Connection pool shut down");
    }

    fn ensure_owned(&self, handle: &PooledConnection) -> Result<(), PoolError> {
        if handle.belongs_to(&self.shared) {
            Ok(())
        } else {
            Err(PoolError::ForeignHandle)
        }
    }
}
