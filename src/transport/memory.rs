//! In-process loopback transport
//!
//! A `MemoryNetwork` is a shared switchboard; every `MemoryTransport`
//! obtained from it is one endpoint with its own address, inbound queue and
//! status-change queue. Delivery is synchronous: a send lands in the peer's
//! queue before `send` returns, so tests can drive client and server tick
//! by tick without any runtime.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{
    describe, ConnectionInfo, ConnectionState, ConnectionStatusChanged, NetMessage, SendMode,
    Transport, END_REASON_LOCAL_PROBLEM, END_REASON_REMOTE_UNREACHABLE,
};
use crate::error::TransportError;
use crate::types::{ConnectionId, ListenSocket, PollGroup};

/// Record of a connection closed by an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConnection {
    pub conn: ConnectionId,
    pub reason: i32,
    pub debug: Option<String>,
    pub linger: bool,
}

type EndpointId = u32;

/// One side of a loopback link
#[derive(Debug)]
struct Half {
    owner: EndpointId,
    peer: Option<ConnectionId>,
    remote: SocketAddr,
    state: ConnectionState,
    poll_group: Option<PollGroup>,
    name: String,
    end_reason: i32,
    end_debug: String,
}

#[derive(Debug, Default)]
struct Endpoint {
    inbound: VecDeque<NetMessage>,
    status: VecDeque<ConnectionStatusChanged>,
    closed: Vec<ClosedConnection>,
}

#[derive(Debug, Default)]
struct NetworkState {
    listeners: HashMap<SocketAddr, EndpointId>,
    endpoints: HashMap<EndpointId, Endpoint>,
    halves: HashMap<ConnectionId, Half>,
    next_endpoint: EndpointId,
}

impl NetworkState {
    /// Move a half to a new state and queue the change for its owner
    fn transition(&mut self, conn: ConnectionId, new_state: ConnectionState, reason: i32, text: &str) {
        let Some(half) = self.halves.get_mut(&conn) else {
            return;
        };

        let old_state = half.state;
        half.state = new_state;
        if !new_state.is_open() && new_state != ConnectionState::None {
            half.end_reason = reason;
            half.end_debug = text.to_string();
        }

        let change = ConnectionStatusChanged {
            conn,
            old_state,
            info: ConnectionInfo {
                state: new_state,
                description: describe(conn, &half.name, Some(half.remote)),
                end_reason: half.end_reason,
                end_debug: half.end_debug.clone(),
            },
        };
        let owner = half.owner;

        if let Some(endpoint) = self.endpoints.get_mut(&owner) {
            endpoint.status.push_back(change);
        }
    }

    fn half_of(&self, owner: EndpointId, conn: ConnectionId) -> Option<&Half> {
        self.halves.get(&conn).filter(|h| h.owner == owner)
    }

    fn half_of_mut(&mut self, owner: EndpointId, conn: ConnectionId) -> Option<&mut Half> {
        self.halves.get_mut(&conn).filter(|h| h.owner == owner)
    }
}

/// Shared loopback network
///
/// Cloning yields another handle to the same network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint with the given local address
    pub fn endpoint(&self, local_addr: SocketAddr) -> MemoryTransport {
        let mut state = self.lock();
        let id = state.next_endpoint;
        state.next_endpoint += 1;
        state.endpoints.insert(id, Endpoint::default());

        MemoryTransport {
            network: self.clone(),
            endpoint: id,
            local_addr,
            listeners: HashMap::new(),
            poll_groups: HashSet::new(),
            next_handle: 1,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One endpoint of a `MemoryNetwork`
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoint: EndpointId,
    local_addr: SocketAddr,
    listeners: HashMap<ListenSocket, SocketAddr>,
    poll_groups: HashSet<PollGroup>,
    next_handle: u32,
}

impl MemoryTransport {
    /// Address this endpoint presents to its peers
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections this endpoint has closed, in order
    pub fn closed_connections(&self) -> Vec<ClosedConnection> {
        self.network
            .lock()
            .endpoints
            .get(&self.endpoint)
            .map(|e| e.closed.clone())
            .unwrap_or_default()
    }

    /// Current state of one of our connections
    pub fn connection_state(&self, conn: ConnectionId) -> Option<ConnectionState> {
        self.network
            .lock()
            .half_of(self.endpoint, conn)
            .map(|h| h.state)
    }

    /// Diagnostic name of one of our connections
    pub fn connection_name(&self, conn: ConnectionId) -> Option<String> {
        self.network
            .lock()
            .half_of(self.endpoint, conn)
            .map(|h| h.name.clone())
    }

    /// Whether we still listen anywhere
    pub fn is_listening(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Number of live poll groups
    pub fn poll_group_count(&self) -> usize {
        self.poll_groups.len()
    }

    /// Simulate a local link failure (timeout, reset) on one of our connections
    pub fn report_problem(&mut self, conn: ConnectionId, text: &str) {
        let mut state = self.network.lock();
        let open = state
            .half_of(self.endpoint, conn)
            .is_some_and(|h| h.state.is_open());
        if open {
            state.transition(
                conn,
                ConnectionState::ProblemDetectedLocally,
                END_REASON_LOCAL_PROBLEM,
                text,
            );
        }
    }

    fn next_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl Transport for MemoryTransport {
    fn listen(&mut self, addr: SocketAddr) -> Result<ListenSocket, TransportError> {
        let mut state = self.network.lock();
        if state.listeners.contains_key(&addr) {
            return Err(TransportError::AddressInUse(addr));
        }
        state.listeners.insert(addr, self.endpoint);
        drop(state);

        let listener = ListenSocket(self.next_handle());
        self.listeners.insert(listener, addr);
        debug!("Memory endpoint {} listening on {}", self.endpoint, addr);
        Ok(listener)
    }

    fn create_poll_group(&mut self) -> Result<PollGroup, TransportError> {
        let group = PollGroup(self.next_handle());
        self.poll_groups.insert(group);
        Ok(group)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        let mut state = self.network.lock();
        let conn = ConnectionId::new();
        state.halves.insert(
            conn,
            Half {
                owner: self.endpoint,
                peer: None,
                remote: addr,
                state: ConnectionState::None,
                poll_group: None,
                name: String::new(),
                end_reason: 0,
                end_debug: String::new(),
            },
        );
        state.transition(conn, ConnectionState::Connecting, 0, "");

        let listener = state.listeners.get(&addr).copied();
        let Some(server) = listener else {
            state.transition(
                conn,
                ConnectionState::ProblemDetectedLocally,
                END_REASON_REMOTE_UNREACHABLE,
                &format!("Nobody is listening on {}", addr),
            );
            return Ok(conn);
        };

        let server_side = ConnectionId::new();
        state.halves.insert(
            server_side,
            Half {
                owner: server,
                peer: Some(conn),
                remote: self.local_addr,
                state: ConnectionState::None,
                poll_group: None,
                name: String::new(),
                end_reason: 0,
                end_debug: String::new(),
            },
        );
        if let Some(half) = state.halves.get_mut(&conn) {
            half.peer = Some(server_side);
        }
        state.transition(server_side, ConnectionState::Connecting, 0, "");

        Ok(conn)
    }

    fn accept(&mut self, conn: ConnectionId) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let half = state
            .half_of(self.endpoint, conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        if half.state != ConnectionState::Connecting {
            return Err(TransportError::InvalidState {
                conn,
                state: half.state,
            });
        }

        let peer = half.peer;
        let peer_waiting = peer
            .and_then(|p| state.halves.get(&p))
            .is_some_and(|p| p.state == ConnectionState::Connecting);
        if !peer_waiting {
            return Err(TransportError::InvalidState {
                conn,
                state: ConnectionState::ClosedByPeer,
            });
        }

        state.transition(conn, ConnectionState::Connected, 0, "");
        if let Some(peer) = peer {
            state.transition(peer, ConnectionState::Connected, 0, "");
        }
        Ok(())
    }

    fn set_poll_group(&mut self, conn: ConnectionId, group: PollGroup) -> bool {
        if !self.poll_groups.contains(&group) {
            return false;
        }
        let mut state = self.network.lock();
        match state.half_of_mut(self.endpoint, conn) {
            Some(half) => {
                half.poll_group = Some(group);
                true
            }
            None => false,
        }
    }

    fn send(&mut self, conn: ConnectionId, payload: &[u8], _mode: SendMode) {
        let mut state = self.network.lock();
        let Some(half) = state.half_of(self.endpoint, conn) else {
            debug!("Dropping send on unknown connection {}", conn);
            return;
        };
        if half.state != ConnectionState::Connected {
            debug!("Dropping send on {} in state {:?}", conn, half.state);
            return;
        }
        let Some(peer) = half.peer else {
            return;
        };
        let Some(peer_owner) = state.halves.get(&peer).map(|p| p.owner) else {
            return;
        };

        if let Some(endpoint) = state.endpoints.get_mut(&peer_owner) {
            endpoint.inbound.push_back(NetMessage {
                conn: peer,
                payload: payload.to_vec(),
            });
        }
    }

    fn receive_on_poll_group(
        &mut self,
        group: PollGroup,
    ) -> Result<Option<NetMessage>, TransportError> {
        if !self.poll_groups.contains(&group) {
            return Err(TransportError::UnknownPollGroup(group));
        }

        let mut state = self.network.lock();
        let members: HashSet<ConnectionId> = state
            .halves
            .iter()
            .filter(|(_, h)| h.owner == self.endpoint && h.poll_group == Some(group))
            .map(|(id, _)| *id)
            .collect();

        let Some(endpoint) = state.endpoints.get_mut(&self.endpoint) else {
            return Ok(None);
        };
        let position = endpoint
            .inbound
            .iter()
            .position(|m| members.contains(&m.conn));
        Ok(position.and_then(|i| endpoint.inbound.remove(i)))
    }

    fn receive_on_connection(
        &mut self,
        conn: ConnectionId,
    ) -> Result<Option<NetMessage>, TransportError> {
        let mut state = self.network.lock();
        if state.half_of(self.endpoint, conn).is_none() {
            return Err(TransportError::UnknownConnection(conn));
        }

        let Some(endpoint) = state.endpoints.get_mut(&self.endpoint) else {
            return Ok(None);
        };
        let position = endpoint.inbound.iter().position(|m| m.conn == conn);
        Ok(position.and_then(|i| endpoint.inbound.remove(i)))
    }

    fn close(&mut self, conn: ConnectionId, reason: i32, debug: Option<&str>, linger: bool) {
        let mut state = self.network.lock();
        if state.half_of(self.endpoint, conn).is_none() {
            return;
        }
        let Some(half) = state.halves.remove(&conn) else {
            return;
        };

        if let Some(endpoint) = state.endpoints.get_mut(&self.endpoint) {
            endpoint.inbound.retain(|m| m.conn != conn);
            endpoint.closed.push(ClosedConnection {
                conn,
                reason,
                debug: debug.map(str::to_string),
                linger,
            });
        }

        // Already queued messages sit in the peer's inbox, so linger or not
        // nothing is lost here; only the peer's view of the link changes.
        if let Some(peer) = half.peer {
            let peer_open = state.halves.get(&peer).is_some_and(|p| p.state.is_open());
            if peer_open {
                if let Some(p) = state.halves.get_mut(&peer) {
                    p.peer = None;
                }
                state.transition(
                    peer,
                    ConnectionState::ClosedByPeer,
                    reason,
                    debug.unwrap_or_default(),
                );
            }
        }
    }

    fn close_listener(&mut self, listener: ListenSocket) {
        if let Some(addr) = self.listeners.remove(&listener) {
            self.network.lock().listeners.remove(&addr);
        }
    }

    fn destroy_poll_group(&mut self, group: PollGroup) {
        if !self.poll_groups.remove(&group) {
            return;
        }
        let mut state = self.network.lock();
        for half in state.halves.values_mut() {
            if half.owner == self.endpoint && half.poll_group == Some(group) {
                half.poll_group = None;
            }
        }
    }

    fn set_connection_name(&mut self, conn: ConnectionId, name: &str) {
        if let Some(half) = self.network.lock().half_of_mut(self.endpoint, conn) {
            half.name = name.to_string();
        }
    }

    fn next_status_change(&mut self) -> Option<ConnectionStatusChanged> {
        self.network
            .lock()
            .endpoints
            .get_mut(&self.endpoint)
            .and_then(|e| e.status.pop_front())
    }
}
