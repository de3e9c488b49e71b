//! Client-side view of the logical session

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No physical connection yet, or it was lost
    Disconnected,
    Connected,
    /// Connection lost, reconnect attempts running
    Reconnecting,
    /// Closed by the owner, never reused
    Closed,
}

/// Session snapshot for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub state: SessionState,
    /// Successful reconnect handshakes so far
    pub reconnects: u64,
}

#[derive(Debug)]
pub struct ClientSession {
    session_id: RwLock<Option<String>>,
    state: RwLock<SessionState>,
    reconnects: AtomicU64,
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            session_id: RwLock::new(None),
            state: RwLock::new(SessionState::Disconnected),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Remember the id the server told us. Returns `true` when it changed.
    pub fn record(&self, session_id: &str) -> bool {
        let mut current = self.session_id.write();
        if current.as_deref() == Some(session_id) {
            return false;
        }
        match current.replace(session_id.to_string()) {
            Some(previous) => info!(previous = %previous, session_id, "Session id changed"),
            None => debug!(session_id, "Learned session id"),
        }
        true
    }

    /// Forget the session, returning the id it had
    pub fn clear(&self) -> Option<String> {
        self.session_id.write().take()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        // Closed is terminal
        if *current != SessionState::Closed {
            *current = state;
        }
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id(),
            state: self.state(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}
