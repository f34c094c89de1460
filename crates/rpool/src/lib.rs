//! rpool: bounded pools of sessions to a stateful, single-threaded engine.
//!
//! Three ways to share a set of [`Connection`]s without ever letting two
//! callers use the same one at once:
//!
//! - [`ConnectionPool`]: exclusive checkout/checkin with overflow growth.
//! - [`WorkerThreadPool`]: worker threads each owning a private connection,
//!   fed from a bounded job queue.
//! - [`AsyncBridge`]: an async caller offloading calls onto backing threads
//!   with thread-affine connections.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod process;
pub mod telemetry;
pub mod wire;
pub mod workers;

#[cfg(test)]
mod testing;

pub use bridge::{AsyncBridge, SlotId, SlotState};
pub use config::{BridgeConfig, MaxOverflow, PoolConfig, WorkerPoolConfig};
pub use connection::{
    Connection, ConnectionFactory, ConnectionId, ConnectionState, SessionSetup, SharedFactory,
    evaluate_with_retry,
};
pub use error::{
    BridgeError, ConnectionError, PoolError, ResultError, SubmitError, WorkerError,
    WorkerPoolError,
};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use process::{ProcessConfig, ProcessConnection, ProcessSpawner};
pub use workers::{Job, JobResult, WorkerId, WorkerState, WorkerThreadPool};
