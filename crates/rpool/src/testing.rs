//! Scriptable in-memory engine for unit tests.
//!
//! Code strings drive behaviour:
//! - `error:<msg>` fails with a remote error
//! - `protocol:<msg>` fails with a protocol error
//! - `sleep:<ms>` blocks the evaluating thread
//! - `panic:<msg>` panics on the evaluating thread
//! - `generation` returns how many times the session has been reset
//! - `whoami` returns the connection id
//! - anything else echoes back as a JSON string

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use crate::connection::{Connection, ConnectionId, ConnectionState, SharedFactory};
use crate::error::ConnectionError;

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub(crate) struct FakeEngine {
    connects: AtomicUsize,
    resets: AtomicUsize,
    closes: AtomicUsize,
    evaluations: AtomicUsize,
    fail_evaluations: AtomicUsize,
    fail_connects: AtomicUsize,
    evaluated: Mutex<Vec<String>>,
    active: Mutex<HashSet<ConnectionId>>,
    root: tempfile::TempDir,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            evaluations: AtomicUsize::new(0),
            fail_evaluations: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
            evaluated: Mutex::new(Vec::new()),
            active: Mutex::new(HashSet::new()),
            root: tempfile::tempdir().expect("tempdir"),
        })
    }

    pub fn connect(self: &Arc<Self>) -> Result<Box<dyn Connection>, ConnectionError> {
        if take_one(&self.fail_connects) {
            return Err(ConnectionError::Connect("engine refused connection".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            id: ConnectionId::new(),
            engine: Arc::clone(self),
            state: ConnectionState::Connected,
            generation: 0,
        }))
    }

    pub fn factory(self: &Arc<Self>) -> SharedFactory {
        let engine = Arc::clone(self);
        Arc::new(move || engine.connect())
    }

    pub fn fail_next_evaluations(&self, n: usize) {
        self.fail_evaluations.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// Connections created and not yet closed.
    pub fn live(&self) -> usize {
        self.connects() - self.closes()
    }

    pub fn evaluated_code(&self) -> Vec<String> {
        self.evaluated.lock().clone()
    }
}

pub(crate) struct FakeConnection {
    id: ConnectionId,
    engine: Arc<FakeEngine>,
    state: ConnectionState,
    generation: u64,
}

impl FakeConnection {
    fn run(&mut self, code: &str) -> Result<serde_json::Value, ConnectionError> {
        self.engine.evaluations.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.engine.fail_evaluations) {
            self.state = ConnectionState::Broken;
            return Err(ConnectionError::TransportClosed("channel severed".into()));
        }
        if let Some(msg) = code.strip_prefix("error:") {
            return Err(ConnectionError::Remote(msg.to_string()));
        }
        if let Some(msg) = code.strip_prefix("protocol:") {
            return Err(ConnectionError::Protocol(msg.to_string()));
        }
        if let Some(msg) = code.strip_prefix("panic:") {
            panic!("{msg}");
        }
        if let Some(ms) = code.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            return Ok(json!(ms));
        }

        self.engine.evaluated.lock().push(code.to_string());
        match code {
            "generation" => Ok(json!(self.generation)),
            "whoami" => Ok(json!(self.id.to_string())),
            _ => Ok(json!(code)),
        }
    }
}

impl Connection for FakeConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn evaluate(&mut self, code: &str) -> Result<serde_json::Value, ConnectionError> {
        match self.state {
            ConnectionState::Closed => return Err(ConnectionError::Closed),
            ConnectionState::Broken | ConnectionState::Uninitialized => {
                return Err(ConnectionError::TransportClosed("not connected".into()));
            }
            ConnectionState::Connected => {}
        }

        assert!(
            self.engine.active.lock().insert(self.id),
            "connection {} used concurrently",
            self.id
        );
        let result = self.run(code);
        self.engine.active.lock().remove(&self.id);
        result
    }

    fn reset(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.engine.resets.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.engine.fail_connects) {
            self.state = ConnectionState::Broken;
            return Err(ConnectionError::Connect("engine refused reconnect".into()));
        }
        self.generation += 1;
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.engine.closes.fetch_add(1, Ordering::SeqCst);
            self.state = ConnectionState::Closed;
        }
    }

    fn working_directory(&mut self) -> Result<PathBuf, ConnectionError> {
        let wd = self.engine.root.path().join(self.id.to_string());
        std::fs::create_dir_all(&wd).map_err(|e| ConnectionError::from_io(&e))?;
        Ok(wd)
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.close();
    }
}
