//! Reliable Chat Library
//!
//! A small multi-client chat built on a poll-style reliable message
//! transport. One binary plays either role.
//!
//! # Features
//! - Placeholder nicknames for newcomers
//! - `/nick` renames, announced to everybody else
//! - Chat relay to every other connected client
//! - Join, departure and link-failure notices
//! - Graceful shutdown with lingering closes
//!
//! # Architecture
//! - `Transport` is a non-blocking facade: listen, connect, accept, send,
//!   receive and a queue of connection status changes
//! - `ChatServer` and `ChatClient` each run one cooperative loop that
//!   drains messages, status changes and console input every tick
//! - A `CancellationToken` is the single quit signal for the loop and the
//!   console reader task
//!
//! # Example
//! ```ignore
//! use reliable_chat::{config, ChatServer, ConsoleInput, WebSocketTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), reliable_chat::AppError> {
//!     let quit = CancellationToken::new();
//!     let (input, _reader) = ConsoleInput::stdin(quit.clone());
//!     let server = ChatServer::bind(
//!         WebSocketTransport::new(),
//!         config::server_listen_addr(config::DEFAULT_SERVER_PORT),
//!         input,
//!         quit,
//!     )?;
//!     server.run().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod input;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::ChatClient;
pub use config::{Cli, Mode};
pub use error::{AppError, ConfigError, SendError, TransportError};
pub use handler::Outgoing;
pub use input::ConsoleInput;
pub use message::{ClientCommand, LocalCommand, ServerNotice};
pub use registry::ConnectionRegistry;
pub use server::ChatServer;
pub use session::ClientSession;
pub use transport::{
    ConnectionInfo, ConnectionState, ConnectionStatusChanged, MemoryNetwork, MemoryTransport,
    NetMessage, SendMode, Transport, WebSocketTransport,
};
pub use types::{ConnectionId, ListenSocket, PollGroup};
