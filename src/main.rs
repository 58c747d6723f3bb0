//! Reliable Chat - Entry Point
//!
//! `reliable_chat server [--port PORT]` hosts a chat;
//! `reliable_chat client SERVER_ADDR` joins one.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reliable_chat::config::{server_listen_addr, Cli, Mode, SHUTDOWN_GRACE};
use reliable_chat::{AppError, ChatClient, ChatServer, ConsoleInput, WebSocketTransport};

fn main() -> ExitCode {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=reliable_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("reliable_chat=info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cli));

    // Lingering closes were flushed by the role's run loop; this only
    // abandons a stdin read still parked in the blocking pool
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let quit = CancellationToken::new();
    let (input, reader) = ConsoleInput::stdin(quit.clone());
    let transport = WebSocketTransport::new();

    let result = match cli.mode {
        Mode::Server { port } => {
            match ChatServer::bind(transport, server_listen_addr(port), input, quit.clone()) {
                Ok(server) => server.run().await,
                Err(e) => Err(e),
            }
        }
        Mode::Client { server } => {
            match ChatClient::connect(transport, server, input, quit.clone(), io::stdout()) {
                Ok(client) => client.run().await,
                Err(e) => Err(e),
            }
        }
    };

    quit.cancel();
    reader.await?;
    info!("Bye");
    result
}
