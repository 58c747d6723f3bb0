//! ChatServer implementation
//!
//! Owns the transport, the listen socket, the poll group and the connection
//! registry. A single cooperative loop drains inbound messages, then
//! connection status changes, then console commands, then sleeps one tick.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SHUTDOWN_GRACE, TICK_INTERVAL};
use crate::error::AppError;
use crate::handler::{self, Outgoing};
use crate::input::ConsoleInput;
use crate::message::{ClientCommand, LocalCommand, ServerNotice};
use crate::registry::ConnectionRegistry;
use crate::transport::{
    flush_lingering, ConnectionState, ConnectionStatusChanged, SendMode, Transport,
    END_REASON_APP_NORMAL,
};
use crate::types::{generate_nickname, ConnectionId, ListenSocket, PollGroup};

/// The chat server role
pub struct ChatServer<T: Transport> {
    transport: T,
    local_addr: SocketAddr,
    listen_socket: Option<ListenSocket>,
    poll_group: Option<PollGroup>,
    registry: ConnectionRegistry,
    input: ConsoleInput,
    quit: CancellationToken,
}

impl<T: Transport> ChatServer<T> {
    /// Start listening; any failure here is fatal for startup
    pub fn bind(
        mut transport: T,
        addr: SocketAddr,
        input: ConsoleInput,
        quit: CancellationToken,
    ) -> Result<Self, AppError> {
        let listen_socket = transport.listen(addr)?;
        let poll_group = match transport.create_poll_group() {
            Ok(group) => group,
            Err(e) => {
                transport.close_listener(listen_socket);
                return Err(e.into());
            }
        };

        Ok(Self {
            transport,
            local_addr: addr,
            listen_socket: Some(listen_socket),
            poll_group: Some(poll_group),
            registry: ConnectionRegistry::new(),
            input,
            quit,
        })
    }

    /// Run the dispatch loop until quit, then shut down gracefully
    pub async fn run(mut self) -> Result<(), AppError> {
        info!("Server listening on {}", self.local_addr);

        let quit = self.quit.clone();
        while !quit.is_cancelled() {
            self.poll()?;

            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = quit.cancelled() => {}
            }
        }

        self.shutdown();
        flush_lingering(&mut self.transport, SHUTDOWN_GRACE).await;
        Ok(())
    }

    /// One loop iteration without the sleep
    pub fn poll(&mut self) -> Result<(), AppError> {
        self.poll_incoming_messages()?;
        self.poll_connection_state_changes()?;
        self.poll_local_user_input();
        Ok(())
    }

    /// Say goodbye to every client and release the listen socket and poll group
    pub fn shutdown(&mut self) {
        info!("Closing connections...");
        for id in self.registry.ids() {
            self.send_notice(id, &ServerNotice::ShuttingDown);
            // Linger so the goodbye is flushed before the link goes away
            self.transport
                .close(id, END_REASON_APP_NORMAL, Some("Server Shutdown"), true);
        }
        self.registry.clear();

        if let Some(listen_socket) = self.listen_socket.take() {
            self.transport.close_listener(listen_socket);
        }
        if let Some(poll_group) = self.poll_group.take() {
            self.transport.destroy_poll_group(poll_group);
        }
    }

    /// Listening socket, until shutdown
    pub fn listen_socket(&self) -> Option<ListenSocket> {
        self.listen_socket
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drain every queued client message through the command handler
    fn poll_incoming_messages(&mut self) -> Result<(), AppError> {
        let Some(poll_group) = self.poll_group else {
            return Ok(());
        };

        while !self.quit.is_cancelled() {
            let Some(msg) = self.transport.receive_on_poll_group(poll_group)? else {
                break;
            };

            let command = ClientCommand::parse(&msg.payload);
            if let ClientCommand::Nick { nickname } = &command {
                self.transport.set_connection_name(msg.conn, nickname);
            }
            let out = handler::handle_command(&mut self.registry, msg.conn, command)?;
            self.deliver(out);
        }
        Ok(())
    }

    /// Drain every queued status change through the session state machine
    fn poll_connection_state_changes(&mut self) -> Result<(), AppError> {
        while let Some(change) = self.transport.next_status_change() {
            self.on_connection_status_changed(change)?;
        }
        Ok(())
    }

    fn poll_local_user_input(&mut self) {
        while !self.quit.is_cancelled() {
            let Some(line) = self.input.next_command() else {
                break;
            };
            match LocalCommand::parse(&line) {
                LocalCommand::Quit => {
                    info!("Shutting down server");
                    self.quit.cancel();
                }
                LocalCommand::Line(_) => {
                    info!("The server only knows one command: '/quit'");
                }
            }
        }
    }

    /// Session state machine, server side
    fn on_connection_status_changed(
        &mut self,
        change: ConnectionStatusChanged,
    ) -> Result<(), AppError> {
        let conn = change.conn;
        match change.info.state {
            // Reported while connections are being destroyed
            ConnectionState::None => {}

            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                if change.old_state == ConnectionState::Connected {
                    let problem = change.info.state == ConnectionState::ProblemDetectedLocally;
                    let action = if problem {
                        "problem detected locally"
                    } else {
                        "closed by peer"
                    };
                    info!(
                        "Connection {} {}, reason {}: {}",
                        change.info.description, action, change.info.end_reason, change.info.end_debug
                    );

                    let out = handler::farewell(
                        &mut self.registry,
                        conn,
                        problem.then_some(change.info.end_debug.as_str()),
                    )?;
                    self.deliver(out);
                } else {
                    // Gone before we accepted: no session to clean up
                    debug!(
                        "Connection {} vanished while {:?}",
                        change.info.description, change.old_state
                    );
                }

                // The peer already tore the link down; lingering would wait forever
                self.transport.close(conn, END_REASON_APP_NORMAL, None, false);
            }

            ConnectionState::Connecting => {
                if self.registry.contains(conn) {
                    return Err(AppError::Invariant(format!(
                        "connection {} is connecting twice",
                        conn
                    )));
                }
                info!("Connection request from {}", change.info.description);
                self.on_connecting(conn)?;
            }

            // We just accepted it ourselves; not news
            ConnectionState::Connected => {}
        }
        Ok(())
    }

    fn on_connecting(&mut self, conn: ConnectionId) -> Result<(), AppError> {
        if let Err(e) = self.transport.accept(conn) {
            self.transport.close(conn, END_REASON_APP_NORMAL, None, false);
            warn!("Can't accept connection {} (it was already closed?): {}", conn, e);
            return Ok(());
        }

        let assigned = self
            .poll_group
            .is_some_and(|group| self.transport.set_poll_group(conn, group));
        if !assigned {
            self.transport.close(conn, END_REASON_APP_NORMAL, None, false);
            warn!("Failed to set poll group for connection {}", conn);
            return Ok(());
        }

        let nickname = generate_nickname();
        let out = handler::greet_newcomer(&mut self.registry, conn, nickname.clone())?;
        self.deliver(out);
        self.transport.set_connection_name(conn, &nickname);

        debug!("Total sessions: {}", self.registry.len());
        Ok(())
    }

    /// Hand outbound instructions to the transport
    fn deliver(&mut self, out: Vec<Outgoing>) {
        for outgoing in out {
            match outgoing {
                Outgoing::Unicast { to, notice } => self.send_notice(to, &notice),
                Outgoing::Broadcast { except, notice } => {
                    let text = notice.to_string();
                    for id in self.registry.ids() {
                        if Some(id) != except {
                            self.transport.send(id, text.as_bytes(), SendMode::Reliable);
                        }
                    }
                }
            }
        }
    }

    fn send_notice(&mut self, to: ConnectionId, notice: &ServerNotice) {
        self.transport
            .send(to, notice.to_string().as_bytes(), SendMode::Reliable);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport, WebSocketTransport};

    const SERVER_PORT: u16 = 27020;

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], SERVER_PORT))
    }

    struct Harness {
        net: MemoryNetwork,
        server: ChatServer<MemoryTransport>,
        input: ConsoleInput,
        quit: CancellationToken,
        next_port: u16,
    }

    /// A raw client endpoint that records what the server sends it
    struct Peer {
        transport: MemoryTransport,
        conn: ConnectionId,
    }

    impl Peer {
        fn send(&mut self, text: &str) {
            self.transport
                .send(self.conn, text.as_bytes(), SendMode::Reliable);
        }

        fn received(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(Some(msg)) = self.transport.receive_on_connection(self.conn) {
                out.push(msg.text());
            }
            out
        }

        fn states(&mut self) -> Vec<ConnectionState> {
            std::iter::from_fn(|| self.transport.next_status_change())
                .map(|c| c.info.state)
                .collect()
        }
    }

    impl Harness {
        fn new() -> Self {
            let net = MemoryNetwork::new();
            let input = ConsoleInput::new();
            let quit = CancellationToken::new();
            let server = ChatServer::bind(
                net.endpoint(server_addr()),
                server_addr(),
                input.clone(),
                quit.clone(),
            )
            .unwrap();

            Self {
                net,
                server,
                input,
                quit,
                next_port: 50000,
            }
        }

        /// Connect a new peer and let the server accept it
        fn join(&mut self) -> Peer {
            self.next_port += 1;
            let mut transport = self
                .net
                .endpoint(SocketAddr::from(([127, 0, 0, 1], self.next_port)));
            let conn = transport.connect(server_addr()).unwrap();
            self.server.poll().unwrap();

            let mut peer = Peer { transport, conn };
            peer.states();
            peer
        }
    }

    fn welcome_nickname(messages: &[String]) -> String {
        let welcome = &messages[0];
        let start = welcome.find('\'').unwrap() + 1;
        let end = start + welcome[start..].find('\'').unwrap();
        welcome[start..end].to_string()
    }

    #[test]
    fn test_bind_twice_fails() {
        let harness = Harness::new();
        let second = ChatServer::bind(
            harness.net.endpoint(server_addr()),
            server_addr(),
            ConsoleInput::new(),
            CancellationToken::new(),
        );
        assert!(matches!(second, Err(AppError::Transport(_))));
    }

    #[test]
    fn test_first_client_is_welcomed_and_alone() {
        let mut harness = Harness::new();
        let mut alice = harness.join();

        let received = alice.received();
        assert_eq!(received.len(), 2);
        assert!(received[0].starts_with("Welcome, stranger."));
        assert_eq!(received[1], "Thou art utterly alone.");
        assert!(welcome_nickname(&received).starts_with("BraveWarrior"));
        assert_eq!(harness.server.registry().len(), 1);
    }

    #[test]
    fn test_second_client_sees_companion_and_first_hears_join() {
        let mut harness = Harness::new();
        let mut alice = harness.join();
        let alice_nick = welcome_nickname(&alice.received());

        let mut bob = harness.join();
        let bob_messages = bob.received();
        let bob_nick = welcome_nickname(&bob_messages);

        assert_eq!(bob_messages.len(), 2);
        assert_eq!(bob_messages[1], alice_nick);

        let alice_messages = alice.received();
        assert_eq!(alice_messages.len(), 1);
        assert!(alice_messages[0].starts_with("Hark!"));
        assert!(alice_messages[0].contains(&bob_nick));
        assert_eq!(harness.server.registry().len(), 2);
    }

    #[test]
    fn test_chat_is_relayed_to_everybody_but_the_sender() {
        let mut harness = Harness::new();
        let mut alice = harness.join();
        let alice_nick = welcome_nickname(&alice.received());
        let mut bob = harness.join();
        let mut carol = harness.join();
        alice.received();
        bob.received();
        carol.received();

        alice.send("hello all");
        harness.server.poll().unwrap();

        let expected = format!("{}: hello all", alice_nick);
        assert_eq!(bob.received(), vec![expected.clone()]);
        assert_eq!(carol.received(), vec![expected]);
        assert!(alice.received().is_empty());
    }

    #[test]
    fn test_rename_keeps_trailing_whitespace_from_the_wire() {
        let mut harness = Harness::new();
        let mut alice = harness.join();
        let alice_nick = welcome_nickname(&alice.received());
        let mut bob = harness.join();
        alice.received();
        bob.received();

        alice.send("/nick Bob ");
        harness.server.poll().unwrap();

        assert_eq!(
            bob.received(),
            vec![format!("{} shall henceforth be known as Bob ", alice_nick)]
        );
        assert_eq!(
            alice.received(),
            vec!["Thou shalt henceforth be known as Bob ".to_string()]
        );
        assert!(harness
            .server
            .registry()
            .iter()
            .any(|s| s.nickname == "Bob "));

        alice.send("after rename");
        harness.server.poll().unwrap();
        assert_eq!(bob.received(), vec!["Bob : after rename".to_string()]);
    }

    #[test]
    fn test_rename_labels_transport_connection() {
        let mut harness = Harness::new();
        let mut alice = harness.join();
        alice.received();

        alice.send("/nick Alice");
        harness.server.poll().unwrap();

        let session = harness.server.registry().iter().next().unwrap().clone();
        assert_eq!(session.nickname, "Alice");
        assert_eq!(
            harness.server.transport().connection_name(session.id).as_deref(),
            Some("Alice")
        );
    }

    #[test]
    fn test_peer_close_removes_session_and_announces_departure() {
        let mut harness = Harness::new();
        let mut alice = harness.join();
        let alice_nick = welcome_nickname(&alice.received());
        let mut bob = harness.join();
        bob.received();

        alice
            .transport
            .close(alice.conn, END_REASON_APP_NORMAL, Some("Goodbye"), true);
        harness.server.poll().unwrap();

        assert_eq!(harness.server.registry().len(), 1);
        assert_eq!(bob.received(), vec![format!("{} hath departed", alice_nick)]);

        let closed = harness.server.transport().closed_connections();
        assert_eq!(closed.len(), 1);
        assert!(!closed[0].linger);
    }

    #[test]
    fn test_local_problem_announces_fall_into_shadow() {
        let mut harness = Harness::new();
        let mut alice = harness.join();
        alice.received();
        let mut bob = harness.join();
        let bob_nick = welcome_nickname(&bob.received());
        alice.received();

        let bob_server_side = harness
            .server
            .registry()
            .iter()
            .find(|s| s.nickname == bob_nick)
            .unwrap()
            .id;
        harness
            .server
            .transport_mut()
            .report_problem(bob_server_side, "Timed out");
        harness.server.poll().unwrap();

        assert_eq!(
            alice.received(),
            vec![format!("Alas, {} hath fallen into shadow.  (Timed out)", bob_nick)]
        );
        assert_eq!(harness.server.registry().len(), 1);
    }

    #[test]
    fn test_peer_vanishing_before_accept_leaves_no_trace() {
        let mut harness = Harness::new();
        let mut alice = harness.join();
        alice.received();

        let mut ghost = harness.net.endpoint(SocketAddr::from(([127, 0, 0, 1], 60000)));
        let conn = ghost.connect(server_addr()).unwrap();
        ghost.close(conn, END_REASON_APP_NORMAL, None, false);

        harness.server.poll().unwrap();

        assert_eq!(harness.server.registry().len(), 1);
        assert!(alice.received().is_empty());
    }

    #[test]
    fn test_registry_tracks_accepted_open_connections() {
        let mut harness = Harness::new();
        let mut peers: Vec<Peer> = (0..4).map(|_| harness.join()).collect();
        assert_eq!(harness.server.registry().len(), 4);

        for peer in peers.iter_mut().take(2) {
            peer.transport
                .close(peer.conn, END_REASON_APP_NORMAL, None, true);
        }
        harness.server.poll().unwrap();
        assert_eq!(harness.server.registry().len(), 2);

        harness.join();
        assert_eq!(harness.server.registry().len(), 3);
    }

    #[test]
    fn test_local_quit_cancels() {
        let mut harness = Harness::new();
        harness.input.push("hello?");
        harness.server.poll().unwrap();
        assert!(!harness.quit.is_cancelled());

        harness.input.push("  /quit  ");
        harness.server.poll().unwrap();
        assert!(harness.quit.is_cancelled());
    }

    #[test]
    fn test_shutdown_says_goodbye_and_lingers() {
        let mut harness = Harness::new();
        let mut alice = harness.join();
        let mut bob = harness.join();
        alice.received();
        bob.received();

        harness.server.shutdown();

        assert_eq!(alice.received(), vec!["Server is shutting down. Goodbye.".to_string()]);
        assert_eq!(bob.received(), vec!["Server is shutting down. Goodbye.".to_string()]);

        let closed = harness.server.transport().closed_connections();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|c| c.linger));
        assert!(closed
            .iter()
            .all(|c| c.debug.as_deref() == Some("Server Shutdown")));

        assert!(harness.server.registry().is_empty());
        assert!(!harness.server.transport().is_listening());
        assert_eq!(harness.server.transport().poll_group_count(), 0);

        assert!(alice.states().contains(&ConnectionState::ClosedByPeer));
    }

    #[tokio::test]
    async fn test_shutdown_notice_reaches_websocket_client() {
        let quit = CancellationToken::new();
        let mut server = ChatServer::bind(
            WebSocketTransport::new(),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            ConsoleInput::new(),
            quit.clone(),
        )
        .unwrap();
        let addr = server
            .listen_socket()
            .and_then(|listener| server.transport().listen_addr(listener))
            .unwrap();

        let mut client = WebSocketTransport::new();
        let conn = client.connect(addr).unwrap();
        for _ in 0..500 {
            server.poll().unwrap();
            if !server.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.registry().len(), 1);

        // Same exit path as the binary: the server is gone once run returns
        quit.cancel();
        server.run().await.unwrap();

        let goodbye = ServerNotice::ShuttingDown.to_string();
        let mut received = Vec::new();
        for _ in 0..500 {
            while let Ok(Some(msg)) = client.receive_on_connection(conn) {
                received.push(msg.text());
            }
            if received.contains(&goodbye) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(received[0].starts_with("Welcome, stranger."));
        assert_eq!(received.last(), Some(&goodbye));
    }

    #[tokio::test]
    async fn test_run_exits_after_quit() {
        let harness = Harness::new();
        harness.input.push("/quit");

        tokio::time::timeout(std::time::Duration::from_secs(1), harness.server.run())
            .await
            .expect("server loop did not stop")
            .unwrap();
        assert!(harness.quit.is_cancelled());
    }
}
