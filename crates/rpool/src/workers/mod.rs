//! Fixed set of worker threads draining a bounded job queue.
//!
//! Each worker owns exactly one connection, never returned to any pool.
//! Results go to a second queue sized well beyond the job queue, so a full
//! result queue means nobody is consuming and is fatal for the worker.
//!
//! Submission and the shutdown transition share one lock: once `stop` has
//! announced shutdown no further job is enqueued.

mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::WorkerPoolConfig;
use crate::connection::SharedFactory;
use crate::error::{ResultError, SubmitError, WorkerError, WorkerPoolError};

pub use worker::{Job, JobResult, WorkerId, WorkerState};
use worker::{Pending, WorkerContext};

struct WorkerHandle {
    id: WorkerId,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<(), WorkerError>>,
}

fn channel<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
    match capacity {
        Some(n) => crossbeam_channel::bounded(n),
        None => crossbeam_channel::unbounded(),
    }
}

/// Pool of worker threads, each with a private connection.
pub struct WorkerThreadPool {
    config: WorkerPoolConfig,
    factory: SharedFactory,
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    results_tx: Sender<JobResult>,
    results_rx: Receiver<JobResult>,
    shutdown: Mutex<bool>,
    pending: Arc<Pending>,
    live: Arc<AtomicUsize>,
    states: Arc<DashMap<WorkerId, WorkerState>>,
    workers: Mutex<Vec<WorkerHandle>>,
    started: AtomicBool,
}

impl WorkerThreadPool {
    /// Build the pool. No thread runs until [`start`](Self::start).
    pub fn new(config: WorkerPoolConfig, factory: SharedFactory) -> Result<Self, WorkerPoolError> {
        config.validate().map_err(WorkerPoolError::InvalidConfig)?;

        let (jobs_tx, jobs_rx) = channel(config.job_capacity());
        let (results_tx, results_rx) = channel(config.result_capacity());

        Ok(Self {
            config,
            factory,
            jobs_tx,
            jobs_rx,
            results_tx,
            results_rx,
            shutdown: Mutex::new(false),
            pending: Arc::new(Pending::new()),
            live: Arc::new(AtomicUsize::new(0)),
            states: Arc::new(DashMap::new()),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Launch every worker thread.
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(WorkerPoolError::AlreadyStarted);
        }

        let mut workers = self.workers.lock();
        for index in 0..self.config.workers {
            let id = WorkerId::new(index);
            let stop = Arc::new(AtomicBool::new(false));
            let ctx = WorkerContext {
                id,
                factory: Arc::clone(&self.factory),
                setup: self.config.setup.clone(),
                jobs: self.jobs_rx.clone(),
                results: self.results_tx.clone(),
                stop: Arc::clone(&stop),
                pending: Arc::clone(&self.pending),
                live: Arc::clone(&self.live),
                states: Arc::clone(&self.states),
                poll_interval: self.config.poll_interval(),
            };

            self.states.insert(id, WorkerState::Starting);
            self.live.fetch_add(1, Ordering::AcqRel);
            let spawned = std::thread::Builder::new()
                .name(format!("rpool-{id}"))
                .spawn(move || ctx.run());

            match spawned {
                Ok(thread) => workers.push(WorkerHandle { id, stop, thread }),
                Err(e) => {
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    self.states.remove(&id);
                    return Err(WorkerPoolError::Spawn(e));
                }
            }
        }

        tracing::info!(
            workers = self.config.workers,
            max_waiting = self.config.max_waiting(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Enqueue `code` on behalf of `caller`.
    ///
    /// `timeout` bounds how long to wait for room in the queue: `None` waits
    /// indefinitely, zero fails immediately with `Full`.
    pub fn submit(
        &self,
        caller: impl Into<String>,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<(), SubmitError> {
        let shutdown = self.shutdown.lock();
        if *shutdown {
            return Err(SubmitError::ShuttingDown);
        }

        let job = Job {
            caller: caller.into(),
            code: code.into(),
        };

        self.pending.add();
        let sent = match timeout {
            None => self
                .jobs_tx
                .send(job)
                .map_err(|_| SubmitError::ShuttingDown),
            Some(t) if t.is_zero() => self.jobs_tx.try_send(job).map_err(|e| match e {
                TrySendError::Full(_) => SubmitError::Full,
                TrySendError::Disconnected(_) => SubmitError::ShuttingDown,
            }),
            Some(t) => self.jobs_tx.send_timeout(job, t).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SubmitError::Timeout(t),
                SendTimeoutError::Disconnected(_) => SubmitError::ShuttingDown,
            }),
        };
        if sent.is_err() {
            self.pending.done();
        }
        drop(shutdown);

        sent
    }

    /// [`submit`](Self::submit) with the configured default timeout.
    pub fn submit_default(
        &self,
        caller: impl Into<String>,
        code: impl Into<String>,
    ) -> Result<(), SubmitError> {
        self.submit(caller, code, Some(self.config.submit_timeout()))
    }

    /// Take the next result. `None` waits indefinitely, zero never waits.
    pub fn get_result(&self, timeout: Option<Duration>) -> Result<JobResult, ResultError> {
        match timeout {
            None => self.results_rx.recv().map_err(|_| ResultError::Empty),
            Some(t) if t.is_zero() => self.results_rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty | TryRecvError::Disconnected => ResultError::Empty,
            }),
            Some(t) => self.results_rx.recv_timeout(t).map_err(|e| match e {
                RecvTimeoutError::Timeout => ResultError::Timeout(t),
                RecvTimeoutError::Disconnected => ResultError::Empty,
            }),
        }
    }

    /// Refuse further submissions; optionally drain accepted jobs and join
    /// the workers.
    ///
    /// With `wait`, returns only once every worker has exited, reporting the
    /// first fatal worker error.
    pub fn stop(&self, flush: bool, wait: bool) -> Result<(), WorkerPoolError> {
        *self.shutdown.lock() = true;
        tracing::info!(flush, wait, pending = self.pending.get(), "Worker pool stopping");

        let flushed = if flush && !self.started.load(Ordering::Acquire) {
            match self.pending.get() {
                0 => Ok(()),
                _ => Err(WorkerPoolError::NotStarted),
            }
        } else if flush {
            self.pending
                .wait_drained(&self.live, self.config.poll_interval())
                .map_err(|pending| WorkerPoolError::NoLiveWorkers { pending })
        } else {
            Ok(())
        };

        let joined = if wait { self.join_workers() } else { Ok(()) };

        joined?;
        flushed
    }

    fn join_workers(&self) -> Result<(), WorkerPoolError> {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return Ok(());
        }
        for worker in &workers {
            worker.stop.store(true, Ordering::Release);
        }

        let mut first_error = None;
        for worker in workers {
            let outcome = worker.thread.join();
            self.states.insert(worker.id, WorkerState::Joined);

            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => WorkerPoolError::Worker {
                    worker: worker.id,
                    source,
                },
                Err(_) => WorkerPoolError::Panicked(worker.id),
            };
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Worker pool joined");
                Ok(())
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.lock()
    }

    /// Jobs accepted whose result has not been produced yet.
    pub fn pending_jobs(&self) -> usize {
        self.pending.get()
    }

    /// Jobs sitting in the queue, not yet picked up by a worker.
    pub fn queued_jobs(&self) -> usize {
        self.jobs_rx.len()
    }

    pub fn ready_results(&self) -> usize {
        self.results_rx.len()
    }

    pub fn worker_states(&self) -> Vec<(WorkerId, WorkerState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl Drop for WorkerThreadPool {
    fn drop(&mut self) {
        *self.shutdown.get_mut() = true;
        if let Err(e) = self.join_workers() {
            tracing::warn!(error = %e, "Worker error during pool drop");
        }
    }
}
