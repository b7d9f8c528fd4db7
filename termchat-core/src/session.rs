//! Session record: id, lifecycle state, and the local message log.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::identity::IdGenerator;
use crate::protocol::{now_millis, Message};

/// Lifecycle of one conversation. Ordered: a session only ever moves forward.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    /// Listener bound and waiting for a peer.
    Waiting = 1,
    Active = 2,
    /// Terminal.
    Ended = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Created,
            1 => SessionState::Waiting,
            2 => SessionState::Active,
            _ => SessionState::Ended,
        }
    }
}

/// One conversation's state. Shared between the endpoint's tasks behind an `Arc`;
/// state and log are guarded independently so snapshots never wait on stream I/O.
#[derive(Debug)]
pub struct Session {
    id: String,
    start_time: DateTime<Utc>,
    state: AtomicU8,
    messages: RwLock<Vec<Message>>,
}

impl Session {
    /// Session with a known id (joiner side, or tests).
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_time: Utc::now(),
            state: AtomicU8::new(SessionState::Created as u8),
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Session with a freshly generated human-readable id (listener side).
    pub fn generate(ids: &mut IdGenerator) -> Self {
        Self::new(ids.next_id())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Append with a fresh local timestamp; any sender-assigned timestamp is overwritten.
    pub fn add_message(&self, mut msg: Message) {
        let mut log = self
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        msg.timestamp = now_millis();
        log.push(msg);
    }

    /// Snapshot of the log; later appends do not affect it.
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unconditional write. Transition legality is the caller's concern; see [`Session::advance`].
    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move forward to `state` if it is later than the current one. Returns true if the state changed.
    pub fn advance(&self, state: SessionState) -> bool {
        let prev = self.state.fetch_max(state as u8, Ordering::AcqRel);
        prev < state as u8
    }
}
