//! Poll-style reliable message transport
//!
//! The chat core never touches sockets directly. It talks to a `Transport`:
//! a non-blocking, poll-driven facade that hands out opaque connection
//! handles, queues inbound messages and queues connection status changes.
//! The dispatch loops drain both queues once per tick.
//!
//! Two implementations ship with the crate:
//! - [`WebSocketTransport`]: real network delivery over tokio-tungstenite
//! - [`MemoryTransport`]: in-process loopback used to drive scenarios in tests

pub mod memory;
pub mod websocket;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::types::{ConnectionId, ListenSocket, PollGroup};

pub use memory::{ClosedConnection, MemoryNetwork, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Reason code for an ordinary application-initiated close
pub const END_REASON_APP_NORMAL: i32 = 0;

/// Reason code when the remote host could not be reached
pub const END_REASON_REMOTE_UNREACHABLE: i32 = 4001;

/// Reason code when the link failed underneath us
pub const END_REASON_LOCAL_PROBLEM: i32 = 5001;

/// Connection lifecycle state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet created, or already destroyed
    None,
    /// Handshake in progress (server side: waiting to be accepted)
    Connecting,
    /// Fully established
    Connected,
    /// The remote end closed the connection
    ClosedByPeer,
    /// The link failed on our side (timeout, reset, ...)
    ProblemDetectedLocally,
}

impl ConnectionState {
    /// Whether the connection is still open in the network sense
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Delivery guarantee requested for a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Reliable,
    Unreliable,
}

/// A message received on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMessage {
    /// Connection the message arrived on
    pub conn: ConnectionId,
    /// Exact payload bytes (no terminator)
    pub payload: Vec<u8>,
}

impl NetMessage {
    /// Payload interpreted as UTF-8, invalid sequences replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Snapshot of a connection carried by a status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// State after the change
    pub state: ConnectionState,
    /// Human readable description (handle, name, remote address)
    pub description: String,
    /// Reason code supplied when the connection ended
    pub end_reason: i32,
    /// Diagnostic text supplied when the connection ended
    pub end_debug: String,
}

/// A connection changed state
///
/// Delivered in the order the changes happened for a given connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatusChanged {
    pub conn: ConnectionId,
    pub old_state: ConnectionState,
    pub info: ConnectionInfo,
}

/// Poll-style reliable message transport
///
/// No method blocks. Status changes and inbound messages are queued by the
/// transport and drained by the caller.
pub trait Transport {
    /// Open a listening socket; inbound attempts surface as `Connecting` changes
    fn listen(&mut self, addr: SocketAddr) -> Result<ListenSocket, TransportError>;

    /// Create a group from which messages of all member connections can be drained
    fn create_poll_group(&mut self) -> Result<PollGroup, TransportError>;

    /// Start connecting; the outcome surfaces as a status change
    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError>;

    /// Accept an inbound connection that is still `Connecting`
    fn accept(&mut self, conn: ConnectionId) -> Result<(), TransportError>;

    /// Move a connection into a poll group
    fn set_poll_group(&mut self, conn: ConnectionId, group: PollGroup) -> bool;

    /// Queue a message; delivery is the transport's business
    fn send(&mut self, conn: ConnectionId, payload: &[u8], mode: SendMode);

    /// Pop the next message from any connection in the group
    fn receive_on_poll_group(
        &mut self,
        group: PollGroup,
    ) -> Result<Option<NetMessage>, TransportError>;

    /// Pop the next message from one connection
    fn receive_on_connection(
        &mut self,
        conn: ConnectionId,
    ) -> Result<Option<NetMessage>, TransportError>;

    /// Close and destroy a connection
    ///
    /// With `linger`, already queued reliable data is flushed before the
    /// link is torn down. Closing an unknown handle does nothing.
    fn close(&mut self, conn: ConnectionId, reason: i32, debug: Option<&str>, linger: bool);

    /// Stop listening
    fn close_listener(&mut self, listener: ListenSocket);

    /// Destroy a poll group; member connections leave it
    fn destroy_poll_group(&mut self, group: PollGroup);

    /// Label a connection for diagnostics
    fn set_connection_name(&mut self, conn: ConnectionId, name: &str);

    /// Pop the next queued status change
    fn next_status_change(&mut self) -> Option<ConnectionStatusChanged>;

    /// Hand over the background tasks still flushing lingering closes
    ///
    /// Transports that deliver synchronously have nothing to hand over.
    fn take_lingering(&mut self) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

/// Wait at most `grace` for lingering closes to flush, then abort the rest
///
/// Must run before the transport is dropped or the runtime shuts down;
/// either one kills the tasks mid-flush.
pub async fn flush_lingering<T: Transport>(transport: &mut T, grace: Duration) {
    let mut tasks = transport.take_lingering();
    if tasks.is_empty() {
        return;
    }

    debug!("Flushing {} lingering connection(s)", tasks.len());
    if tokio::time::timeout(grace, join_all(tasks.iter_mut()))
        .await
        .is_err()
    {
        warn!("Lingering connections did not flush within {:?}", grace);
        for task in &tasks {
            task.abort();
        }
    }
}

/// Format a connection description the same way for every transport
pub(crate) fn describe(conn: ConnectionId, name: &str, remote: Option<SocketAddr>) -> String {
    match (name.is_empty(), remote) {
        (true, Some(remote)) => format!("#{} {}", conn, remote),
        (true, None) => format!("#{}", conn),
        (false, Some(remote)) => format!("#{} '{}' {}", conn, name, remote),
        (false, None) => format!("#{} '{}'", conn, name),
    }
}
