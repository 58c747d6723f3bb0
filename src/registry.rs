//! Connection registry
//!
//! Maps every accepted connection to its `ClientSession`. Only the server
//! role keeps one.

use std::collections::HashMap;

use crate::error::AppError;
use crate::session::ClientSession;
use crate::types::ConnectionId;

/// Active sessions keyed by connection
///
/// Iteration order is unspecified; nothing in the chat protocol depends on it.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<ConnectionId, ClientSession>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection
    ///
    /// A connection can only be accepted once, so a duplicate key means
    /// the state machine is broken.
    pub fn add(&mut self, id: ConnectionId, nickname: impl Into<String>) -> Result<(), AppError> {
        if self.sessions.contains_key(&id) {
            return Err(AppError::Invariant(format!(
                "connection {} registered twice",
                id
            )));
        }
        self.sessions.insert(id, ClientSession::new(id, nickname));
        Ok(())
    }

    /// Change a session's nickname
    ///
    /// Returns false (and changes nothing) if the connection is unknown.
    pub fn rename(&mut self, id: ConnectionId, nickname: impl Into<String>) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.set_nickname(nickname);
                true
            }
            None => false,
        }
    }

    /// Remove a session
    ///
    /// Idempotent: returns `None` when nothing was registered under `id`.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Iterate over all sessions
    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    /// Connection ids of all sessions
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session (server shutdown)
    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
