//! Worker thread - owns one private connection for its whole lifetime.
//!
//! Lifecycle: `Starting → Connected → Running → Stopping → Joined`.
//! The job queue is polled with a short timeout so the stop flag is seen
//! promptly even when idle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, SessionSetup, SharedFactory, evaluate_with_retry};
use crate::error::{ConnectionError, WorkerError};

/// Index of a worker thread within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Starting,
    Connected,
    Running,
    Stopping,
    Joined,
}

/// A unit of work, tagged with an opaque caller id for correlation.
#[derive(Debug, Clone)]
pub struct Job {
    pub caller: String,
    pub code: String,
}

/// Outcome of a job, tagged with the submitting caller's id.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub caller: String,
    pub outcome: Result<serde_json::Value, ConnectionError>,
}

/// Count of accepted jobs whose result has not been produced yet.
pub(super) struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    pub(super) fn new() -> Self {
        Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    pub(super) fn add(&self) {
        *self.count.lock() += 1;
    }

    pub(super) fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub(super) fn get(&self) -> usize {
        *self.count.lock()
    }

    /// Block until every accepted job has produced a result.
    ///
    /// Gives up with the outstanding count once no worker is left alive.
    pub(super) fn wait_drained(&self, live: &AtomicUsize, poll: Duration) -> Result<(), usize> {
        let mut count = self.count.lock();
        while *count > 0 {
            if live.load(Ordering::Acquire) == 0 {
                return Err(*count);
            }
            self.drained.wait_for(&mut count, poll);
        }
        Ok(())
    }
}

/// Marks the worker as gone when its thread exits, including by unwinding,
/// so a flush never waits on a dead worker.
struct Alive<'a> {
    id: WorkerId,
    live: &'a AtomicUsize,
    states: &'a DashMap<WorkerId, WorkerState>,
}

impl Drop for Alive<'_> {
    fn drop(&mut self) {
        self.states.insert(self.id, WorkerState::Stopping);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Settles one accepted job, after its result was pushed or its worker died.
struct InFlight<'a>(&'a Pending);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Everything a worker thread needs, moved into the thread at spawn.
pub(super) struct WorkerContext {
    pub id: WorkerId,
    pub factory: SharedFactory,
    pub setup: SessionSetup,
    pub jobs: Receiver<Job>,
    pub results: Sender<JobResult>,
    pub stop: Arc<AtomicBool>,
    pub pending: Arc<Pending>,
    pub live: Arc<AtomicUsize>,
    pub states: Arc<DashMap<WorkerId, WorkerState>>,
    pub poll_interval: Duration,
}

impl WorkerContext {
    pub(super) fn run(self) -> Result<(), WorkerError> {
        let _alive = Alive {
            id: self.id,
            live: &self.live,
            states: &self.states,
        };
        let outcome = self.run_session();

        match &outcome {
            Ok(()) => tracing::debug!(worker = %self.id, "Worker stopped"),
            Err(e) => tracing::error!(worker = %self.id, error = %e, "Worker exited with error"),
        }
        outcome
    }

    fn run_session(&self) -> Result<(), WorkerError> {
        let mut conn = self.factory.connect().map_err(WorkerError::Connect)?;

        if let Err(e) = self.setup.prepare(conn.as_mut()) {
            conn.close();
            return Err(WorkerError::Setup(e));
        }
        self.set_state(WorkerState::Connected);
        tracing::debug!(worker = %self.id, connection = %conn.id(), "Worker connected");

        self.set_state(WorkerState::Running);
        let outcome = self.serve(conn.as_mut());
        conn.close();
        outcome
    }

    fn serve(&self, conn: &mut dyn Connection) -> Result<(), WorkerError> {
        while !self.stop.load(Ordering::Acquire) {
            let job = match self.jobs.recv_timeout(self.poll_interval) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let _in_flight = InFlight(&self.pending);
            let outcome = evaluate_with_retry(conn, &job.code);
            if let Err(ref e) = outcome {
                tracing::debug!(worker = %self.id, caller = %job.caller, error = %e, "Job failed");
            }

            let pushed = self.results.try_send(JobResult {
                caller: job.caller,
                outcome,
            });

            match pushed {
                Ok(()) => {}
                Err(TrySendError::Full(result)) => {
                    tracing::error!(
                        worker = %self.id,
                        caller = %result.caller,
                        "Result queue full, consumers are not draining results"
                    );
                    return Err(WorkerError::ResultQueueFull);
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(WorkerError::ResultQueueClosed);
                }
            }
        }
        Ok(())
    }

    fn set_state(&self, state: WorkerState) {
        self.states.insert(self.id, state);
    }
}
