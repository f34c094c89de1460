//! Error taxonomy shared by the pool, worker threads and the bridge.
//!
//! Transport failures are the only errors recovered locally (one
//! reconnect-and-retry at the point of use). Everything else surfaces to the
//! caller unchanged.

use std::io;
use std::time::Duration;

use crate::workers::WorkerId;

/// Failure reported by a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The remote engine evaluated the request and reported an error.
    #[error("remote engine error: {0}")]
    Remote(String),

    /// The channel to the engine was severed.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Establishing the session failed.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// Copying a support file into the working directory failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The engine answered with something we did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed locally and cannot be used.
    #[error("connection is closed")]
    Closed,
}

impl ConnectionError {
    /// Map an I/O error from the channel. Broken pipes and EOF mean the
    /// engine went away; anything else is a protocol-level failure.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Self::TransportClosed(err.to_string()),
            _ => Self::Protocol(err.to_string()),
        }
    }

    /// The channel itself failed (as opposed to the evaluated code).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportClosed(_))
    }

    /// Errors that warrant one reconnect-and-retry of the same call.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TransportClosed(_) | Self::Remote(_))
    }
}

/// Errors from [`ConnectionPool`](crate::ConnectionPool) and its handles.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every idle connection is checked out and the overflow cap is reached.
    #[error("pool exhausted: {limit} connections already checked out")]
    ResourceExhausted { limit: usize },

    #[error("pool has been shut down")]
    Closed,

    /// The handle has already been returned to its pool.
    #[error("connection handle already released")]
    Released,

    #[error("handle belongs to a different pool")]
    ForeignHandle,

    /// Guard rejecting operations that would affect every pooled session.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(&'static str),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Rejection from [`WorkerThreadPool::submit`](crate::WorkerThreadPool::submit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The job queue is full and no wait was requested.
    #[error("job queue is full")]
    Full,

    #[error("job queue stayed full for {0:?}")]
    Timeout(Duration),

    #[error("pool is shutting down, no more jobs accepted")]
    ShuttingDown,
}

/// Failure from [`WorkerThreadPool::get_result`](crate::WorkerThreadPool::get_result).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResultError {
    #[error("no result available")]
    Empty,

    #[error("no result arrived within {0:?}")]
    Timeout(Duration),
}

/// Fatal condition inside a worker thread. Ends that worker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("worker failed to connect: {0}")]
    Connect(ConnectionError),

    #[error("worker session setup failed: {0}")]
    Setup(ConnectionError),

    /// Consumers are not draining results.
    #[error("result queue is full")]
    ResultQueueFull,

    #[error("result queue closed")]
    ResultQueueClosed,
}

/// Errors from the [`WorkerThreadPool`](crate::WorkerThreadPool) lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("invalid worker pool configuration: {0}")]
    InvalidConfig(String),

    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("worker pool was never started")]
    NotStarted,

    /// Flush requested but every worker has exited.
    #[error("no live workers left to drain {pending} pending jobs")]
    NoLiveWorkers { pending: usize },

    #[error("{worker} failed: {source}")]
    Worker {
        worker: WorkerId,
        #[source]
        source: WorkerError,
    },

    #[error("{0} panicked")]
    Panicked(WorkerId),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Errors surfaced to a coroutine awaiting [`AsyncBridge::call`](crate::AsyncBridge::call).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The call failed again after the single reconnect-and-retry.
    #[error("call failed after reconnect: {0}")]
    Fatal(ConnectionError),

    /// A new session could not be established or prepared.
    #[error("failed to establish session: {0}")]
    Connect(ConnectionError),

    /// Non-recoverable failure reported by the connection.
    #[error(transparent)]
    Connection(ConnectionError),

    #[error("bridge has been shut down")]
    ShutDown,

    /// The backing thread went away without answering.
    #[error("backing thread dropped the call")]
    WorkerLost,

    #[error("call panicked: {0}")]
    Panicked(String),

    #[error("invalid bridge configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn backing thread: {0}")]
    Spawn(#[from] io::Error),
}
