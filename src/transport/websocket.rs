//! WebSocket transport
//!
//! Every connection is one WebSocket over TCP, which gives reliable,
//! ordered, message-framed delivery. Each link runs in its own tokio task
//! (read and write multiplexed with `select!`), and talks to the
//! synchronous `Transport` facade through unbounded mpsc channels that the
//! facade drains with `try_recv`, so no facade method ever blocks.
//!
//! Close frames carry the application reason code and text.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use super::{
    describe, ConnectionInfo, ConnectionState, ConnectionStatusChanged, NetMessage, SendMode,
    Transport, END_REASON_APP_NORMAL, END_REASON_LOCAL_PROBLEM, END_REASON_REMOTE_UNREACHABLE,
};
use crate::error::{SendError, TransportError};
use crate::types::{ConnectionId, ListenSocket, PollGroup};

/// How long a lingering close waits for the peer's close reply
const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Facade → link task
enum Outbound {
    Data(Vec<u8>),
    Close { reason: i32, text: String },
}

/// Link and listener tasks → facade
enum LinkEvent {
    /// Handshake with a new peer finished at one of our listeners
    Incoming {
        conn: ConnectionId,
        remote: SocketAddr,
        ws: WebSocketStream<TcpStream>,
    },
    /// Our outgoing handshake finished
    Established { conn: ConnectionId },
    /// A message arrived
    Data { conn: ConnectionId, payload: Vec<u8> },
    /// The link is gone
    Closed {
        conn: ConnectionId,
        by_peer: bool,
        reason: i32,
        text: String,
    },
}

/// Facade-side state of one connection
struct Link {
    state: ConnectionState,
    name: String,
    remote: SocketAddr,
    poll_group: Option<PollGroup>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Handshaken stream waiting for `accept`
    pending: Option<(WebSocketStream<TcpStream>, mpsc::UnboundedReceiver<Outbound>)>,
    task: Option<JoinHandle<()>>,
    end_reason: i32,
    end_debug: String,
}

impl Link {
    fn new(remote: SocketAddr, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            state: ConnectionState::None,
            name: String::new(),
            remote,
            poll_group: None,
            outbound,
            pending: None,
            task: None,
            end_reason: 0,
            end_debug: String::new(),
        }
    }

    /// Queue a message for the link task
    ///
    /// Returns an error if the task has already ended.
    fn send(&self, msg: Outbound) -> Result<(), SendError> {
        self.outbound
            .send(msg)
            .map_err(|_| SendError::ChannelClosed)
    }
}

struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// `Transport` over tokio-tungstenite WebSockets
///
/// Must be created inside a tokio runtime; background tasks are spawned on it.
pub struct WebSocketTransport {
    runtime: Handle,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    links: HashMap<ConnectionId, Link>,
    listeners: HashMap<ListenSocket, Listener>,
    poll_groups: HashSet<PollGroup>,
    inbound: VecDeque<NetMessage>,
    status: VecDeque<ConnectionStatusChanged>,
    /// Link tasks of closed connections still sending their close frame
    lingering: Vec<JoinHandle<()>>,
    next_handle: u32,
}

impl WebSocketTransport {
    /// Create a transport bound to the current tokio runtime
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            runtime: Handle::current(),
            events_tx,
            events_rx,
            links: HashMap::new(),
            listeners: HashMap::new(),
            poll_groups: HashSet::new(),
            inbound: VecDeque::new(),
            status: VecDeque::new(),
            lingering: Vec::new(),
            next_handle: 1,
        }
    }

    /// Actual address of a listening socket (useful after binding port 0)
    pub fn listen_addr(&self, listener: ListenSocket) -> Option<SocketAddr> {
        self.listeners.get(&listener).map(|l| l.addr)
    }

    fn next_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Move a link to a new state and queue the change
    fn transition(&mut self, conn: ConnectionId, new_state: ConnectionState, reason: i32, text: &str) {
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };

        let old_state = link.state;
        link.state = new_state;
        if !new_state.is_open() {
            link.end_reason = reason;
            link.end_debug = text.to_string();
        }

        self.status.push_back(ConnectionStatusChanged {
            conn,
            old_state,
            info: ConnectionInfo {
                state: new_state,
                description: describe(conn, &link.name, Some(link.remote)),
                end_reason: link.end_reason,
                end_debug: link.end_debug.clone(),
            },
        });
    }

    /// Fold everything the background tasks reported into the facade queues
    fn pump(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                LinkEvent::Incoming { conn, remote, ws } => {
                    debug!("Connection request from {} as {}", remote, conn);
                    let (tx, rx) = mpsc::unbounded_channel();
                    let mut link = Link::new(remote, tx);
                    link.pending = Some((ws, rx));
                    self.links.insert(conn, link);
                    self.transition(conn, ConnectionState::Connecting, 0, "");
                }
                LinkEvent::Established { conn } => {
                    let connecting = self
                        .links
                        .get(&conn)
                        .is_some_and(|l| l.state == ConnectionState::Connecting);
                    if connecting {
                        self.transition(conn, ConnectionState::Connected, 0, "");
                    }
                }
                LinkEvent::Data { conn, payload } => {
                    if self.links.contains_key(&conn) {
                        self.inbound.push_back(NetMessage { conn, payload });
                    }
                }
                LinkEvent::Closed {
                    conn,
                    by_peer,
                    reason,
                    text,
                } => {
                    let open = self.links.get(&conn).is_some_and(|l| l.state.is_open());
                    if open {
                        let state = if by_peer {
                            ConnectionState::ClosedByPeer
                        } else {
                            ConnectionState::ProblemDetectedLocally
                        };
                        self.transition(conn, state, reason, &text);
                    }
                }
            }
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for listener in self.listeners.values() {
            listener.task.abort();
        }
        for link in self.links.values() {
            if let Some(task) = &link.task {
                task.abort();
            }
        }
        for task in &self.lingering {
            task.abort();
        }
    }
}

impl Transport for WebSocketTransport {
    fn listen(&mut self, addr: SocketAddr) -> Result<ListenSocket, TransportError> {
        let std_listener = std::net::TcpListener::bind(addr)
            .map_err(|source| TransportError::Listen { addr, source })?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener)?
        };
        let task = self
            .runtime
            .spawn(accept_loop(listener, self.events_tx.clone()));

        let handle = ListenSocket(self.next_handle());
        self.listeners.insert(
            handle,
            Listener {
                addr: local_addr,
                task,
            },
        );
        debug!("Listening for WebSocket connections on {}", local_addr);
        Ok(handle)
    }

    fn create_poll_group(&mut self) -> Result<PollGroup, TransportError> {
        let group = PollGroup(self.next_handle());
        self.poll_groups.insert(group);
        Ok(group)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let events = self.events_tx.clone();

        let task = self.runtime.spawn(async move {
            let url = format!("ws://{}", addr);
            match tokio_tungstenite::connect_async(url).await {
                Ok((ws, _response)) => {
                    let _ = events.send(LinkEvent::Established { conn });
                    run_link(conn, ws, rx, events).await;
                }
                Err(e) => {
                    let _ = events.send(LinkEvent::Closed {
                        conn,
                        by_peer: false,
                        reason: END_REASON_REMOTE_UNREACHABLE,
                        text: e.to_string(),
                    });
                }
            }
        });

        let mut link = Link::new(addr, tx);
        link.task = Some(task);
        self.links.insert(conn, link);
        self.transition(conn, ConnectionState::Connecting, 0, "");
        Ok(conn)
    }

    fn accept(&mut self, conn: ConnectionId) -> Result<(), TransportError> {
        self.pump();

        let link = self
            .links
            .get_mut(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        if link.state != ConnectionState::Connecting {
            return Err(TransportError::InvalidState {
                conn,
                state: link.state,
            });
        }
        let Some((ws, rx)) = link.pending.take() else {
            return Err(TransportError::InvalidState {
                conn,
                state: link.state,
            });
        };

        link.task = Some(
            self.runtime
                .spawn(run_link(conn, ws, rx, self.events_tx.clone())),
        );
        self.transition(conn, ConnectionState::Connected, 0, "");
        Ok(())
    }

    fn set_poll_group(&mut self, conn: ConnectionId, group: PollGroup) -> bool {
        if !self.poll_groups.contains(&group) {
            return false;
        }
        match self.links.get_mut(&conn) {
            Some(link) => {
                link.poll_group = Some(group);
                true
            }
            None => false,
        }
    }

    fn send(&mut self, conn: ConnectionId, payload: &[u8], _mode: SendMode) {
        // TCP underneath: unreliable sends are delivered reliably too.
        let Some(link) = self.links.get(&conn) else {
            debug!("Dropping send on unknown connection {}", conn);
            return;
        };
        if link.state != ConnectionState::Connected {
            debug!("Dropping send on {} in state {:?}", conn, link.state);
            return;
        }
        if let Err(e) = link.send(Outbound::Data(payload.to_vec())) {
            debug!("Send on {} failed: {}", conn, e);
        }
    }

    fn receive_on_poll_group(
        &mut self,
        group: PollGroup,
    ) -> Result<Option<NetMessage>, TransportError> {
        if !self.poll_groups.contains(&group) {
            return Err(TransportError::UnknownPollGroup(group));
        }
        self.pump();

        let links = &self.links;
        let position = self.inbound.iter().position(|m| {
            links
                .get(&m.conn)
                .is_some_and(|l| l.poll_group == Some(group))
        });
        Ok(position.and_then(|i| self.inbound.remove(i)))
    }

    fn receive_on_connection(
        &mut self,
        conn: ConnectionId,
    ) -> Result<Option<NetMessage>, TransportError> {
        self.pump();
        if !self.links.contains_key(&conn) {
            return Err(TransportError::UnknownConnection(conn));
        }

        let position = self.inbound.iter().position(|m| m.conn == conn);
        Ok(position.and_then(|i| self.inbound.remove(i)))
    }

    fn close(&mut self, conn: ConnectionId, reason: i32, debug: Option<&str>, linger: bool) {
        let Some(link) = self.links.remove(&conn) else {
            return;
        };
        self.inbound.retain(|m| m.conn != conn);

        if linger && link.state == ConnectionState::Connected {
            let close = Outbound::Close {
                reason,
                text: debug.unwrap_or_default().to_string(),
            };
            // The task flushes queued data, sends the close frame and exits.
            if link.send(close).is_ok() {
                self.lingering.retain(|task| !task.is_finished());
                self.lingering.extend(link.task);
                return;
            }
        }

        // Without linger the link simply dies; the peer sees a reset.
        if let Some(task) = link.task {
            task.abort();
        }
    }

    fn close_listener(&mut self, listener: ListenSocket) {
        if let Some(listener) = self.listeners.remove(&listener) {
            listener.task.abort();
            debug!("Stopped listening on {}", listener.addr);
        }
    }

    fn destroy_poll_group(&mut self, group: PollGroup) {
        if !self.poll_groups.remove(&group) {
            return;
        }
        for link in self.links.values_mut() {
            if link.poll_group == Some(group) {
                link.poll_group = None;
            }
        }
    }

    fn set_connection_name(&mut self, conn: ConnectionId, name: &str) {
        if let Some(link) = self.links.get_mut(&conn) {
            link.name = name.to_string();
        }
    }

    fn next_status_change(&mut self) -> Option<ConnectionStatusChanged> {
        self.pump();
        self.status.pop_front()
    }

    fn take_lingering(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.lingering)
    }
}

/// Accept TCP connections and complete the WebSocket handshake for each
async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<LinkEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!("New TCP connection from {}", remote);
                let events = events.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => {
                            let _ = events.send(LinkEvent::Incoming {
                                conn: ConnectionId::new(),
                                remote,
                                ws,
                            });
                        }
                        Err(e) => warn!("WebSocket handshake with {} failed: {}", remote, e),
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Pump one established WebSocket until either side closes it
async fn run_link<S>(
    conn: ConnectionId,
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let closed = |by_peer: bool, reason: i32, text: String| LinkEvent::Closed {
        conn,
        by_peer,
        reason,
        text,
    };

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = events.send(LinkEvent::Data { conn, payload: text.as_bytes().to_vec() });
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    let _ = events.send(LinkEvent::Data { conn, payload: data.to_vec() });
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (reason, text) = frame
                        .map(|f| (reason_from_close_code(f.code), f.reason.to_string()))
                        .unwrap_or((END_REASON_APP_NORMAL, String::new()));
                    debug!("Peer closed {} ({}): {}", conn, reason, text);
                    let _ = events.send(closed(true, reason, text));
                    let _ = sink.close().await;
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite
                }
                Some(Err(e)) => {
                    let _ = events.send(closed(false, END_REASON_LOCAL_PROBLEM, e.to_string()));
                    break;
                }
                None => {
                    let _ = events.send(closed(false, END_REASON_LOCAL_PROBLEM, "Connection reset".to_string()));
                    break;
                }
            },
            next = outbound.recv() => match next {
                Some(Outbound::Data(payload)) => {
                    if let Err(e) = sink.send(into_ws_message(payload)).await {
                        let _ = events.send(closed(false, END_REASON_LOCAL_PROBLEM, e.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close { reason, text }) => {
                    let frame = CloseFrame {
                        code: close_code_from_reason(reason),
                        reason: text.into(),
                    };
                    if sink.send(WsMessage::Close(Some(frame))).await.is_ok() {
                        let drain = async { while let Some(Ok(_)) = stream.next().await {} };
                        let _ = tokio::time::timeout(CLOSE_REPLY_TIMEOUT, drain).await;
                    }
                    break;
                }
                None => break,
            }
        }
    }

    debug!("Link task ended for {}", conn);
}

fn into_ws_message(payload: Vec<u8>) -> WsMessage {
    match String::from_utf8(payload) {
        Ok(text) => WsMessage::Text(text.into()),
        Err(e) => WsMessage::Binary(e.into_bytes().into()),
    }
}

fn close_code_from_reason(reason: i32) -> CloseCode {
    match u16::try_from(reason) {
        Ok(code @ 1000..=4999) => CloseCode::from(code),
        _ => CloseCode::Normal,
    }
}

fn reason_from_close_code(code: CloseCode) -> i32 {
    match code {
        CloseCode::Normal => END_REASON_APP_NORMAL,
        other => i32::from(u16::from(other)),
    }
}
