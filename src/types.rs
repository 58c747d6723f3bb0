//! Basic type definitions for the chat core
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based opaque connection handle
//! - `ListenSocket` / `PollGroup`: transport-local handles
//!
//! Also holds the placeholder nickname generator.

use uuid::Uuid;

/// Prefix of the nickname handed to every freshly accepted client
pub const NICKNAME_PREFIX: &str = "BraveWarrior";

/// Smallest numeric suffix of a generated nickname
pub const NICKNAME_SUFFIX_MIN: u32 = 10_000;

/// One past the largest numeric suffix of a generated nickname
pub const NICKNAME_SUFFIX_END: u32 = 110_000;

/// Opaque connection handle (newtype pattern)
///
/// Wraps a UUID v4 so that handles minted by independent transport
/// endpoints never collide. Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a listening socket, local to the transport that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenSocket(pub u32);

/// Handle of a poll group, local to the transport that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollGroup(pub u32);

/// Generate a placeholder nickname such as `BraveWarrior42137`
///
/// The suffix is drawn uniformly from `[10000, 109999]`. Uniqueness is
/// not guaranteed.
pub fn generate_nickname() -> String {
    use rand::Rng;
    let suffix = rand::thread_rng().gen_range(NICKNAME_SUFFIX_MIN..NICKNAME_SUFFIX_END);
    format!("{}{}", NICKNAME_PREFIX, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_nickname_prefix() {
        let nick = generate_nickname();
        assert!(nick.starts_with(NICKNAME_PREFIX));
    }

    #[test]
    fn test_nickname_suffix_range() {
        for _ in 0..1000 {
            let nick = generate_nickname();
            let suffix: u32 = nick[NICKNAME_PREFIX.len()..].parse().unwrap();
            assert!((NICKNAME_SUFFIX_MIN..NICKNAME_SUFFIX_END).contains(&suffix));
        }
    }
}
