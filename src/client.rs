//! ChatClient implementation
//!
//! Holds one connection to the server. Everything the server sends is
//! printed verbatim, one message per line; console lines are forwarded
//! verbatim except `/quit`.

use std::io::Write;
use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{SHUTDOWN_GRACE, TICK_INTERVAL};
use crate::error::AppError;
use crate::input::ConsoleInput;
use crate::message::LocalCommand;
use crate::transport::{
    flush_lingering, ConnectionState, ConnectionStatusChanged, SendMode, Transport,
    END_REASON_APP_NORMAL,
};
use crate::types::ConnectionId;

/// The chat client role
pub struct ChatClient<T: Transport, W: Write> {
    transport: T,
    connection: Option<ConnectionId>,
    input: ConsoleInput,
    quit: CancellationToken,
    output: W,
}

impl<T: Transport, W: Write> ChatClient<T, W> {
    /// Start connecting to the server
    ///
    /// Only the creation of the connection can fail here; whether the
    /// server answers is reported later as a status change.
    pub fn connect(
        mut transport: T,
        server: SocketAddr,
        input: ConsoleInput,
        quit: CancellationToken,
        output: W,
    ) -> Result<Self, AppError> {
        info!("Connecting to chat server at {}", server);
        let conn = transport.connect(server).map_err(|e| {
            error!("Failed to create connection: {}", e);
            AppError::ConnectFailed(server)
        })?;

        Ok(Self {
            transport,
            connection: Some(conn),
            input,
            quit,
            output,
        })
    }

    /// Run the dispatch loop until quit, then let a `/quit` goodbye flush
    pub async fn run(mut self) -> Result<(), AppError> {
        let quit = self.quit.clone();
        while !quit.is_cancelled() {
            self.poll()?;

            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = quit.cancelled() => {}
            }
        }

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

    /// Connection to the server, until it closes
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Print everything the server sent since the last tick
    fn poll_incoming_messages(&mut self) -> Result<(), AppError> {
        let Some(conn) = self.connection else {
            return Ok(());
        };

        while !self.quit.is_cancelled() {
            let Some(msg) = self.transport.receive_on_connection(conn)? else {
                break;
            };
            self.output.write_all(&msg.payload)?;
            self.output.write_all(b"\n")?;
        }
        self.output.flush()?;
        Ok(())
    }

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
                    self.quit.cancel();
                    info!("Disconnecting from chat server");

                    // Linger: the server is still there to take the last data
                    if let Some(conn) = self.connection.take() {
                        self.transport
                            .close(conn, END_REASON_APP_NORMAL, Some("Goodbye"), true);
                    }
                }
                LocalCommand::Line(text) => {
                    if let Some(conn) = self.connection {
                        self.transport
                            .send(conn, text.as_bytes(), SendMode::Reliable);
                    }
                }
            }
        }
    }

    /// Session state machine, client side
    fn on_connection_status_changed(
        &mut self,
        change: ConnectionStatusChanged,
    ) -> Result<(), AppError> {
        if self.connection.is_some_and(|conn| conn != change.conn) {
            return Err(AppError::Invariant(format!(
                "status change for foreign connection {}",
                change.conn
            )));
        }

        match change.info.state {
            ConnectionState::None | ConnectionState::Connecting => {}

            ConnectionState::Connected => {
                info!("Connected to server OK");
            }

            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                self.quit.cancel();

                let reason = &change.info.end_debug;
                if change.old_state == ConnectionState::Connecting {
                    error!(
                        "We sought the remote host, yet our efforts were met with defeat.  ({})",
                        reason
                    );
                } else if change.info.state == ConnectionState::ProblemDetectedLocally {
                    error!(
                        "Alas, troubles beset us; we have lost contact with the host.  ({})",
                        reason
                    );
                } else {
                    info!("The host hath bidden us farewell.  ({})", reason);
                }

                // Already closed on the other end, so no linger
                self.transport
                    .close(change.conn, END_REASON_APP_NORMAL, None, false);
                self.connection = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ChatServer;
    use crate::transport::{MemoryNetwork, MemoryTransport};

    type TestClient = ChatClient<MemoryTransport, Vec<u8>>;

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 27020))
    }

    struct World {
        net: MemoryNetwork,
        server: ChatServer<MemoryTransport>,
        next_port: u16,
    }

    struct Client {
        chat: TestClient,
        input: ConsoleInput,
        quit: CancellationToken,
    }

    impl Client {
        fn lines(&mut self) -> Vec<String> {
            let text = String::from_utf8(self.chat.output.drain(..).collect()).unwrap();
            text.lines().map(str::to_string).collect()
        }
    }

    impl World {
        fn new() -> Self {
            let net = MemoryNetwork::new();
            let server = ChatServer::bind(
                net.endpoint(server_addr()),
                server_addr(),
                ConsoleInput::new(),
                CancellationToken::new(),
            )
            .unwrap();
            Self {
                net,
                server,
                next_port: 50000,
            }
        }

        fn client(&mut self) -> Client {
            self.next_port += 1;
            let input = ConsoleInput::new();
            let quit = CancellationToken::new();
            let chat = ChatClient::connect(
                self.net
                    .endpoint(SocketAddr::from(([127, 0, 0, 1], self.next_port))),
                server_addr(),
                input.clone(),
                quit.clone(),
                Vec::new(),
            )
            .unwrap();
            Client { chat, input, quit }
        }

        /// Run every party a few times so all queued traffic settles
        fn settle(&mut self, clients: &mut [&mut Client]) {
            for _ in 0..3 {
                for client in clients.iter_mut() {
                    client.chat.poll().unwrap();
                }
                self.server.poll().unwrap();
            }
            for client in clients.iter_mut() {
                client.chat.poll().unwrap();
            }
        }
    }

    #[test]
    fn test_client_prints_welcome() {
        let mut world = World::new();
        let mut alice = world.client();
        world.settle(&mut [&mut alice]);

        let lines = alice.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Welcome, stranger."));
        assert_eq!(lines[1], "Thou art utterly alone.");
        assert!(!alice.quit.is_cancelled());
        assert!(alice.chat.connection().is_some());
    }

    #[test]
    fn test_console_lines_are_forwarded_trimmed() {
        let mut world = World::new();
        let mut alice = world.client();
        let mut bob = world.client();
        world.settle(&mut [&mut alice, &mut bob]);
        alice.lines();
        bob.lines();

        alice.input.push("  /nick Alice  \n");
        alice.input.push("   ");
        alice.input.push("hello bob");
        world.settle(&mut [&mut alice, &mut bob]);

        assert_eq!(
            alice.lines(),
            vec!["Thou shalt henceforth be known as Alice".to_string()]
        );
        let bob_lines = bob.lines();
        assert_eq!(bob_lines.len(), 2);
        assert!(bob_lines[0].ends_with("shall henceforth be known as Alice"));
        assert_eq!(bob_lines[1], "Alice: hello bob");
    }

    #[test]
    fn test_quit_closes_with_linger_and_server_announces_departure() {
        let mut world = World::new();
        let mut alice = world.client();
        let mut bob = world.client();
        world.settle(&mut [&mut alice, &mut bob]);
        bob.lines();

        alice.input.push("/nick Alice");
        alice.input.push("/quit");
        world.settle(&mut [&mut alice, &mut bob]);

        assert!(alice.quit.is_cancelled());
        assert!(alice.chat.connection().is_none());
        let closed = alice.chat.transport().closed_connections();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].linger);
        assert_eq!(closed[0].debug.as_deref(), Some("Goodbye"));

        let bob_lines = bob.lines();
        assert_eq!(bob_lines.last().map(String::as_str), Some("Alice hath departed"));
        assert_eq!(world.server.registry().len(), 1);
        assert!(!bob.quit.is_cancelled());
    }

    #[test]
    fn test_server_shutdown_ends_client() {
        let mut world = World::new();
        let mut alice = world.client();
        world.settle(&mut [&mut alice]);
        alice.lines();

        world.server.shutdown();
        alice.chat.poll().unwrap();

        assert_eq!(
            alice.lines(),
            vec!["Server is shutting down. Goodbye.".to_string()]
        );
        assert!(alice.quit.is_cancelled());
        assert!(alice.chat.connection().is_none());

        let closed = alice.chat.transport().closed_connections();
        assert_eq!(closed.len(), 1);
        assert!(!closed[0].linger);
    }

    #[test]
    fn test_connect_to_nobody_quits() {
        let net = MemoryNetwork::new();
        let quit = CancellationToken::new();
        let mut client = ChatClient::connect(
            net.endpoint(SocketAddr::from(([127, 0, 0, 1], 50000))),
            server_addr(),
            ConsoleInput::new(),
            quit.clone(),
            Vec::new(),
        )
        .unwrap();

        client.poll().unwrap();
        assert!(quit.is_cancelled());
        assert!(client.connection().is_none());
        assert!(client.output().is_empty());
    }

    #[test]
    fn test_lost_contact_quits() {
        let mut world = World::new();
        let mut alice = world.client();
        world.settle(&mut [&mut alice]);

        let conn = alice.chat.connection().unwrap();
        alice.chat.transport_mut().report_problem(conn, "Timed out");
        alice.chat.poll().unwrap();

        assert!(alice.quit.is_cancelled());
        assert!(alice.chat.connection().is_none());

        // The server still thinks alice is there until its own side notices
        assert_eq!(world.server.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_run_exits_after_quit() {
        let mut world = World::new();
        let alice = world.client();
        world.server.poll().unwrap();
        alice.input.push("/quit");

        tokio::time::timeout(std::time::Duration::from_secs(1), alice.chat.run())
            .await
            .expect("client loop did not stop")
            .unwrap();
        assert!(alice.quit.is_cancelled());
    }
}
