//! Client session definition
//!
//! The server-side record of one accepted connection.

use crate::types::ConnectionId;

/// Accepted client session
///
/// Exists from the moment a connection is accepted until it closes or the
/// server shuts down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    /// Connection this session belongs to
    pub id: ConnectionId,
    /// Display name, not necessarily unique
    pub nickname: String,
}

impl ClientSession {
    /// Create a new session with the given nickname
    pub fn new(id: ConnectionId, nickname: impl Into<String>) -> Self {
        Self {
            id,
            nickname: nickname.into(),
        }
    }

    /// Get the display name for this session
    pub fn display_name(&self) -> &str {
        &self.nickname
    }

    /// Change the display name
    pub fn set_nickname(&mut self, nickname: impl Into<String>) {
        self.nickname = nickname.into();
    }
}
