//! Command line configuration
//!
//! `reliable_chat server [--port PORT]` or `reliable_chat client SERVER_ADDR`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::error::ConfigError;

/// Port used when none is given
pub const DEFAULT_SERVER_PORT: u16 = 27020;

/// Pause between two dispatch loop iterations
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Time given to lingering connections before the process exits
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "reliable_chat", about = "Multi-client chat over a reliable message transport")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Host a chat server
    Server {
        /// Port to listen on
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT, value_parser = parse_port)]
        port: u16,
    },
    /// Join a chat server
    Client {
        /// Server address: IP, IP:PORT, [IPv6] or [IPv6]:PORT
        #[arg(value_parser = parse_server_addr)]
        server: SocketAddr,
    },
}

/// Address the server binds (all IPv4 interfaces)
pub fn server_listen_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

/// Parse a port in `1..=65535`
pub fn parse_port(s: &str) -> Result<u16, ConfigError> {
    match s.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(s.to_string())),
    }
}

/// Parse a server address, defaulting the port to 27020 when absent or zero
pub fn parse_server_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    let s = s.trim();

    let mut addr = if let Ok(addr) = s.parse::<SocketAddr>() {
        addr
    } else {
        let host = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
        SocketAddr::new(ip, DEFAULT_SERVER_PORT)
    };

    if addr.port() == 0 {
        addr.set_port(DEFAULT_SERVER_PORT);
    }
    Ok(addr)
}
