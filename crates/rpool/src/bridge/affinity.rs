//! AffinitySlot - the connection cached by one backing thread.
//!
//! A slot is owned by exactly one thread for its whole life, so the
//! connection inside it is never touched concurrently. State is mirrored
//! into a shared map purely for observation.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, SessionSetup, SharedFactory};
use crate::error::{BridgeError, ConnectionError};

/// Index of a backing thread (and its slot) within a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// `Uninitialized → Connected ⇄ Broken → Reconnecting → Connected`, with
/// `Closed` once the owning thread exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    Uninitialized,
    Connected,
    Broken,
    Reconnecting,
    Closed,
}

pub(super) type SlotStates = Arc<DashMap<SlotId, SlotState>>;

pub(super) struct AffinitySlot {
    id: SlotId,
    factory: SharedFactory,
    setup: SessionSetup,
    conn: Option<Box<dyn Connection>>,
    state: SlotState,
    states: SlotStates,
}

impl AffinitySlot {
    pub(super) fn new(
        id: SlotId,
        factory: SharedFactory,
        setup: SessionSetup,
        states: SlotStates,
    ) -> Self {
        states.insert(id, SlotState::Uninitialized);
        Self {
            id,
            factory,
            setup,
            conn: None,
            state: SlotState::Uninitialized,
            states,
        }
    }

    fn set_state(&mut self, state: SlotState) {
        self.state = state;
        self.states.insert(self.id, state);
    }

    /// Replace whatever connection is cached with a fresh, prepared one.
    fn establish(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut old) = self.conn.take() {
            old.close();
        }

        let mut conn = self.factory.connect()?;
        if let Err(e) = self.setup.prepare(conn.as_mut()) {
            conn.close();
            return Err(e);
        }

        tracing::debug!(slot = %self.id, connection = %conn.id(), "Slot connected");
        self.conn = Some(conn);
        self.set_state(SlotState::Connected);
        Ok(())
    }

    fn connection(&mut self) -> Result<&mut dyn Connection, BridgeError> {
        if self.state != SlotState::Connected || self.conn.is_none() {
            self.establish().map_err(BridgeError::Connect)?;
        }
        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(BridgeError::Connect(ConnectionError::Closed)),
        }
    }

    /// Run `f` against the cached connection, connecting lazily.
    ///
    /// A recoverable failure reconnects and retries exactly once; a second
    /// failure is fatal for this call and leaves the slot `Broken`.
    pub(super) fn call<T>(
        &mut self,
        f: &mut dyn FnMut(&mut dyn Connection) -> Result<T, ConnectionError>,
    ) -> Result<T, BridgeError> {
        let first = f(self.connection()?);
        let error = match first {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_recoverable() => return Err(BridgeError::Connection(e)),
            Err(e) => e,
        };

        tracing::warn!(slot = %self.id, error = %error, "Call failed, reconnecting");
        self.set_state(SlotState::Broken);
        self.set_state(SlotState::Reconnecting);
        if let Err(e) = self.establish() {
            self.set_state(SlotState::Broken);
            return Err(BridgeError::Fatal(e));
        }

        let second = f(self.connection()?);
        match second {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_recoverable() {
                    self.set_state(SlotState::Broken);
                }
                tracing::error!(slot = %self.id, error = %e, "Call failed after reconnect");
                Err(BridgeError::Fatal(e))
            }
        }
    }

    /// The connection may be mid-request after a panic; force a reconnect.
    pub(super) fn mark_broken(&mut self) {
        if self.state == SlotState::Connected {
            self.set_state(SlotState::Broken);
        }
    }

    pub(super) fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.set_state(SlotState::Closed);
        tracing::debug!(slot = %self.id, "Slot closed");
    }
}

impl Drop for AffinitySlot {
    fn drop(&mut self) {
        if self.state != SlotState::Closed {
            self.close();
        }
    }
}
