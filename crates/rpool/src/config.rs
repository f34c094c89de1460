//! Configuration for the connection pool, worker threads and the bridge.
//!
//! All configs deserialize with per-field defaults and expose `with_*`
//! setters. Validation happens when the owning object is constructed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::SessionSetup;

/// Worker threads per CPU. The workload is I/O bound: threads spend most of
/// their time waiting on the remote engine.
pub const DEFAULT_THREADCOUNT_SCALE: usize = 5;

/// Waiting jobs allowed per worker thread.
pub const DEFAULT_WAITING_JOBS_SCALE: usize = 10;

/// Result queue capacity relative to the job queue.
pub const RESULT_QUEUE_SCALE: usize = 100;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

pub const DEFAULT_SUBMIT_TIMEOUT_MS: u64 = 500;

/// How many connections may exist beyond `pool_size`.
///
/// Serialized in its legacy integer form: any negative value means
/// unbounded, `n >= 0` caps overflow at `n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum MaxOverflow {
    #[default]
    Unbounded,
    Limited(usize),
}

impl TryFrom<i64> for MaxOverflow {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < 0 {
            return Ok(Self::Unbounded);
        }
        usize::try_from(value)
            .map(Self::Limited)
            .map_err(|e| format!("max_overflow {value} out of range: {e}"))
    }
}

impl From<MaxOverflow> for i64 {
    fn from(value: MaxOverflow) -> Self {
        match value {
            MaxOverflow::Unbounded => -1,
            MaxOverflow::Limited(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }
}

/// Configuration for [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle connections maintained (and created up front).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default)]
    pub max_overflow: MaxOverflow,

    /// Skip the reset on checkin. Lower latency, but session state leaks
    /// between users.
    #[serde(default)]
    pub realtime: bool,
}

fn default_pool_size() -> usize {
    1
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_overflow: MaxOverflow::default(),
            realtime: false,
        }
    }
}

impl PoolConfig {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Self::default()
        }
    }

    pub fn with_max_overflow(mut self, max_overflow: MaxOverflow) -> Self {
        self.max_overflow = max_overflow;
        self
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Upper bound on concurrently checked-out connections, if any.
    pub fn capacity(&self) -> Option<usize> {
        match self.max_overflow {
            MaxOverflow::Unbounded => None,
            MaxOverflow::Limited(n) => Some(self.pool_size.saturating_add(n)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1".into());
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    num_cpus::get().max(1) * DEFAULT_THREADCOUNT_SCALE
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_submit_timeout_ms() -> u64 {
    DEFAULT_SUBMIT_TIMEOUT_MS
}

/// Configuration for [`WorkerThreadPool`](crate::WorkerThreadPool).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPoolConfig {
    /// Worker threads, each owning one private connection.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Job queue capacity. `None` derives it from `workers`; `Some(0)` means
    /// unbounded.
    #[serde(default)]
    pub max_waiting: Option<usize>,

    /// How long an idle worker waits on the job queue before re-checking its
    /// stop flag.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout used by `submit_default`.
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    #[serde(default)]
    pub setup: SessionSetup,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_waiting: None,
            poll_interval_ms: default_poll_interval_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            setup: SessionSetup::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(workers: usize, max_waiting: usize) -> Self {
        Self {
            workers,
            max_waiting: Some(max_waiting),
            ..Self::default()
        }
    }

    pub fn with_setup(mut self, setup: SessionSetup) -> Self {
        self.setup = setup;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_waiting(&self) -> usize {
        self.max_waiting
            .unwrap_or_else(|| self.workers.saturating_mul(DEFAULT_WAITING_JOBS_SCALE))
    }

    /// `None` means unbounded.
    pub fn job_capacity(&self) -> Option<usize> {
        match self.max_waiting() {
            0 => None,
            n => Some(n),
        }
    }

    pub fn result_capacity(&self) -> Option<usize> {
        self.job_capacity()
            .map(|n| n.saturating_mul(RESULT_QUEUE_SCALE))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be at least 1".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be positive".into());
        }
        Ok(())
    }
}

/// Configuration for [`AsyncBridge`](crate::AsyncBridge).
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Backing threads, each caching at most one connection.
    #[serde(default = "default_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub setup: SessionSetup,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            setup: SessionSetup::default(),
        }
    }
}

impl BridgeConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Self::default()
        }
    }

    pub fn with_setup(mut self, setup: SessionSetup) -> Self {
        self.setup = setup;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".into());
        }
        Ok(())
    }
}
