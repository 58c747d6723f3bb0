//! Chat protocol definitions
//!
//! The protocol is plain human-readable text in both directions. Client
//! payloads are parsed into a `ClientCommand`; everything the server says
//! is a `ServerNotice` rendered through `Display`, so outbound strings are
//! built with `format!` and never with fixed-size buffers.

use std::fmt;

/// Keyword that introduces a rename
pub const NICK_COMMAND: &str = "/nick";

/// Local console command that shuts the process down
pub const QUIT_COMMAND: &str = "/quit";

/// Client → Server payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `/nick <name>`: change the sender's nickname
    Nick { nickname: String },
    /// Anything else: ordinary chat text
    Chat { text: String },
}

impl ClientCommand {
    /// Parse an inbound payload of exact length
    ///
    /// Only the first five bytes are compared against `/nick`, so
    /// `/nickname` renames to `name`. Whitespace directly after the keyword
    /// is skipped; the remainder, trailing whitespace included, is the new
    /// nickname. Invalid UTF-8 is replaced, never rejected.
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);

        match text.strip_prefix(NICK_COMMAND) {
            Some(rest) => ClientCommand::Nick {
                nickname: rest.trim_start_matches(is_c_space).to_string(),
            },
            None => ClientCommand::Chat {
                text: text.into_owned(),
            },
        }
    }
}

/// Whitespace as the C locale classifies it (includes vertical tab)
fn is_c_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\x0b' | '\x0c' | '\r')
}

/// A trimmed, non-empty console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    /// `/quit`
    Quit,
    /// Any other line
    Line(String),
}

impl LocalCommand {
    pub fn parse(line: &str) -> Self {
        if line == QUIT_COMMAND {
            LocalCommand::Quit
        } else {
            LocalCommand::Line(line.to_string())
        }
    }
}

/// Server → Client text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotice {
    /// First message a newcomer receives
    Welcome { nickname: String },
    /// Newcomer has no companions
    Alone,
    /// One already connected companion
    Companion { nickname: String },
    /// Announced to everybody else when someone joins
    Joined { nickname: String },
    /// Announced to everybody else on `/nick`
    Renamed { old: String, new: String },
    /// Reply to the sender of `/nick`
    RenameConfirmed { nickname: String },
    /// Relayed chat line
    Chat { from: String, text: String },
    /// A peer's connection failed on the server side
    FellIntoShadow { nickname: String, reason: String },
    /// A peer closed its connection
    Departed { nickname: String },
    /// Last words before the server closes every connection
    ShuttingDown,
}

impl fmt::Display for ServerNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerNotice::Welcome { nickname } => write!(
                f,
                "Welcome, stranger.  Thou art known to us for now as '{}'; \
                 upon thine command '/nick' we shall know thee otherwise.",
                nickname
            ),
            ServerNotice::Alone => write!(f, "Thou art utterly alone."),
            ServerNotice::Companion { nickname } => write!(f, "{}", nickname),
            ServerNotice::Joined { nickname } => write!(
                f,
                "Hark!  A stranger hath joined this merry host.  For now we shall call them '{}'",
                nickname
            ),
            ServerNotice::Renamed { old, new } => {
                write!(f, "{} shall henceforth be known as {}", old, new)
            }
            ServerNotice::RenameConfirmed { nickname } => {
                write!(f, "Thou shalt henceforth be known as {}", nickname)
            }
            ServerNotice::Chat { from, text } => write!(f, "{}: {}", from, text),
            ServerNotice::FellIntoShadow { nickname, reason } => {
                write!(f, "Alas, {} hath fallen into shadow.  ({})", nickname, reason)
            }
            ServerNotice::Departed { nickname } => write!(f, "{} hath departed", nickname),
            ServerNotice::ShuttingDown => write!(f, "Server is shutting down. Goodbye."),
        }
    }
}
