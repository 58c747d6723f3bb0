//! Command protocol handler
//!
//! Turns inbound payloads and connection lifecycle moments into outbound
//! chat text. Handlers only touch the registry and return `Outgoing`
//! instructions; the server delivers them through its transport, resolving
//! broadcasts against the registry at delivery time.

use tracing::info;

use crate::error::AppError;
use crate::message::{ClientCommand, ServerNotice};
use crate::registry::ConnectionRegistry;
use crate::types::ConnectionId;

/// One outbound delivery instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Send to a single connection
    Unicast { to: ConnectionId, notice: ServerNotice },
    /// Send to every registered session except `except`
    Broadcast {
        except: Option<ConnectionId>,
        notice: ServerNotice,
    },
}

impl Outgoing {
    fn to(to: ConnectionId, notice: ServerNotice) -> Self {
        Outgoing::Unicast { to, notice }
    }

    fn to_all_except(except: ConnectionId, notice: ServerNotice) -> Self {
        Outgoing::Broadcast {
            except: Some(except),
            notice,
        }
    }

    fn to_all(notice: ServerNotice) -> Self {
        Outgoing::Broadcast {
            except: None,
            notice,
        }
    }
}

/// Handle one parsed payload from a registered connection
pub fn handle_command(
    registry: &mut ConnectionRegistry,
    from: ConnectionId,
    command: ClientCommand,
) -> Result<Vec<Outgoing>, AppError> {
    match command {
        ClientCommand::Nick { nickname } => rename(registry, from, nickname),
        ClientCommand::Chat { text } => chat(registry, from, text),
    }
}

/// `/nick`: tell everybody else, confirm to the sender, then rename
pub fn rename(
    registry: &mut ConnectionRegistry,
    from: ConnectionId,
    nickname: String,
) -> Result<Vec<Outgoing>, AppError> {
    let old = sender_nickname(registry, from)?;
    info!("{} renamed to '{}'", old, nickname);

    let out = vec![
        Outgoing::to_all_except(
            from,
            ServerNotice::Renamed {
                old,
                new: nickname.clone(),
            },
        ),
        Outgoing::to(
            from,
            ServerNotice::RenameConfirmed {
                nickname: nickname.clone(),
            },
        ),
    ];

    registry.rename(from, nickname);
    Ok(out)
}

/// Ordinary chat: relay to everybody but the sender
pub fn chat(
    registry: &ConnectionRegistry,
    from: ConnectionId,
    text: String,
) -> Result<Vec<Outgoing>, AppError> {
    let sender = sender_nickname(registry, from)?;
    Ok(vec![Outgoing::to_all_except(
        from,
        ServerNotice::Chat { from: sender, text },
    )])
}

/// Greet a newly accepted connection and register it
///
/// The newcomer gets the welcome, then either the "alone" notice or one
/// message per existing session. Everybody else hears about the newcomer.
pub fn greet_newcomer(
    registry: &mut ConnectionRegistry,
    conn: ConnectionId,
    nickname: String,
) -> Result<Vec<Outgoing>, AppError> {
    if registry.contains(conn) {
        return Err(AppError::Invariant(format!(
            "connection {} is already registered",
            conn
        )));
    }

    let mut out = vec![Outgoing::to(
        conn,
        ServerNotice::Welcome {
            nickname: nickname.clone(),
        },
    )];

    if registry.is_empty() {
        out.push(Outgoing::to(conn, ServerNotice::Alone));
    } else {
        out.extend(registry.iter().map(|companion| {
            Outgoing::to(
                conn,
                ServerNotice::Companion {
                    nickname: companion.display_name().to_string(),
                },
            )
        }));
    }

    out.push(Outgoing::to_all_except(
        conn,
        ServerNotice::Joined {
            nickname: nickname.clone(),
        },
    ));

    registry.add(conn, nickname)?;
    Ok(out)
}

/// Drop a connected peer's session and tell everybody who is left
///
/// `problem` carries the diagnostic text when the link failed locally;
/// `None` means the peer closed the connection itself.
pub fn farewell(
    registry: &mut ConnectionRegistry,
    conn: ConnectionId,
    problem: Option<&str>,
) -> Result<Vec<Outgoing>, AppError> {
    let session = registry.remove(conn).ok_or_else(|| {
        AppError::Invariant(format!("connected peer {} has no session", conn))
    })?;

    let notice = match problem {
        Some(reason) => ServerNotice::FellIntoShadow {
            nickname: session.nickname,
            reason: reason.to_string(),
        },
        None => ServerNotice::Departed {
            nickname: session.nickname,
        },
    };
    Ok(vec![Outgoing::to_all(notice)])
}

fn sender_nickname(registry: &ConnectionRegistry, from: ConnectionId) -> Result<String, AppError> {
    registry
        .get(from)
        .map(|s| s.display_name().to_string())
        .ok_or_else(|| AppError::Invariant(format!("message from unregistered connection {}", from)))
}
