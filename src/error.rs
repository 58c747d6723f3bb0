//! Error types for the chat core
//!
//! Defines application-level errors, transport errors, command line
//! parse errors and link send errors. Uses thiserror for ergonomic error definitions.

use std::net::SocketAddr;

use thiserror::Error;

use crate::transport::ConnectionState;
use crate::types::{ConnectionId, PollGroup};

/// Application-level errors
///
/// Everything that escapes the dispatch loop is fatal for the process.
#[derive(Debug, Error)]
pub enum AppError {
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task panicked or was aborted
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Could not create the outgoing connection
    #[error("Failed to create connection to {0}")]
    ConnectFailed(SocketAddr),

    /// Programming error: continuing would corrupt the session registry
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// Errors reported by a `Transport` implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open the listening socket
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Handle does not belong to this transport (or was already closed)
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Handle does not name a live poll group
    #[error("Unknown poll group: {0:?}")]
    UnknownPollGroup(PollGroup),

    /// Operation not valid in the connection's current state
    #[error("Connection {conn} is in state {state:?}")]
    InvalidState {
        conn: ConnectionId,
        state: ConnectionState,
    },

    /// Listen address already taken
    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command line configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Port is not a number in 1..=65535
    #[error("Invalid port {0}")]
    InvalidPort(String),

    /// Server address could not be parsed
    #[error("Invalid server address '{0}'")]
    InvalidAddress(String),
}

/// Link send errors
///
/// Occurs when queueing data for a WebSocket link whose task has ended.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
