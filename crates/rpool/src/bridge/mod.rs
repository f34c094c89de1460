//! AsyncBridge - lets a single async caller use blocking connections.
//!
//! Calls are boxed into tasks and handed to a fixed set of backing threads
//! over an unbounded channel. Each thread owns one [`AffinitySlot`], so the
//! connection it caches is only ever used from that thread. The awaiting
//! future resolves through a oneshot when its specific call completes; calls
//! carry no ordering relative to each other.

mod affinity;

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::BridgeConfig;
use crate::connection::{Connection, SharedFactory};
use crate::error::{BridgeError, ConnectionError};

pub use affinity::{SlotId, SlotState};
use affinity::{AffinitySlot, SlotStates};

type Task = Box<dyn FnOnce(&mut AffinitySlot) + Send>;

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn serve(mut slot: AffinitySlot, tasks: Receiver<Task>) {
    while let Ok(task) = tasks.recv() {
        task(&mut slot);
    }
    slot.close();
}

pub struct AsyncBridge {
    config: BridgeConfig,
    tasks: Mutex<Option<Sender<Task>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    states: SlotStates,
}

impl AsyncBridge {
    /// Spawn the backing threads. Connections are created lazily, on each
    /// thread's first call.
    pub fn new(config: BridgeConfig, factory: SharedFactory) -> Result<Self, BridgeError> {
        config.validate().map_err(BridgeError::InvalidConfig)?;

        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let states = SlotStates::default();
        let mut threads = Vec::with_capacity(config.max_workers);

        for index in 0..config.max_workers {
            let id = SlotId::new(index);
            let slot = AffinitySlot::new(
                id,
                Arc::clone(&factory),
                config.setup.clone(),
                Arc::clone(&states),
            );
            let tasks = rx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("rpool-bridge-{index}"))
                .spawn(move || serve(slot, tasks))?;
            threads.push(thread);
        }

        tracing::info!(max_workers = config.max_workers, "Async bridge started");
        Ok(Self {
            config,
            tasks: Mutex::new(Some(tx)),
            threads: Mutex::new(threads),
            states,
        })
    }

    fn dispatch(&self, task: Task) -> Result<(), BridgeError> {
        match self.tasks.lock().as_ref() {
            Some(tx) => tx.send(task).map_err(|_| BridgeError::ShutDown),
            None => Err(BridgeError::ShutDown),
        }
    }

    /// Run `f` on a backing thread against that thread's connection.
    ///
    /// The call is dispatched immediately; the returned future only waits for
    /// its result. A recoverable failure is retried once on a fresh
    /// connection, a second failure resolves to [`BridgeError::Fatal`].
    pub fn call<T, F>(
        &self,
        f: F,
    ) -> impl Future<Output = Result<T, BridgeError>> + Send + use<T, F>
    where
        T: Send + 'static,
        F: FnMut(&mut dyn Connection) -> Result<T, ConnectionError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut f = f;
        let dispatched = self.dispatch(Box::new(move |slot: &mut AffinitySlot| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| slot.call(&mut f)))
                .unwrap_or_else(|payload| Err(BridgeError::Panicked(panic_message(payload))));
            if matches!(outcome, Err(BridgeError::Panicked(_))) {
                slot.mark_broken();
            }
            // The caller may have stopped waiting.
            let _ = tx.send(outcome);
        }));

        async move {
            dispatched?;
            rx.await.map_err(|_| BridgeError::WorkerLost)?
        }
    }

    pub fn evaluate(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<serde_json::Value, BridgeError>> + Send + use<> {
        let code = code.to_string();
        self.call(move |conn| conn.evaluate(&code))
    }

    pub fn slot_states(&self) -> Vec<(SlotId, SlotState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.tasks.lock().is_none()
    }

    /// Stop accepting calls, let queued calls finish, then join every
    /// backing thread. Each thread closes its cached connection on exit.
    ///
    /// The join is synchronous and blocks the calling thread until every
    /// queued call has run. Called from inside an async task, that stalls
    /// the executor thread for as long as the queue takes to drain; wrap it
    /// in `tokio::task::spawn_blocking` there.
    pub fn shutdown(&self) {
        let sender = self.tasks.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("Bridge thread panicked outside a call");
            }
        }
        tracing::info!("Async bridge shut down");
    }
}

/// Dropping runs [`AsyncBridge::shutdown`], so it blocks the same way. A
/// bridge dropped inside an async task holds up the executor thread until
/// its queued calls finish.
impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
