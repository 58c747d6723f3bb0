//! Non-blocking console input
//!
//! A background task reads lines and pushes them into a mutex-guarded FIFO;
//! the dispatch loop pops from it without ever waiting. The reader selects
//! between the next line and the quit token, so shutdown never has to wait
//! for a keystroke.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Queue of raw console lines shared with the reader task
#[derive(Debug, Clone, Default)]
pub struct ConsoleInput {
    queue: Arc<Mutex<VecDeque<String>>>,
}

impl ConsoleInput {
    /// Create an empty queue with no reader attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Start reading lines from stdin
    pub fn stdin(quit: CancellationToken) -> (Self, JoinHandle<()>) {
        Self::spawn(tokio::io::stdin(), quit)
    }

    /// Start reading lines from any async reader
    ///
    /// A read error or end of input that was not caused by quitting
    /// cancels `quit`.
    pub fn spawn<R>(reader: R, quit: CancellationToken) -> (Self, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let input = Self::new();
        let queue = input.clone();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                tokio::select! {
                    _ = quit.cancelled() => break,
                    read = reader.read_until(b'\n', &mut buf) => match read {
                        Ok(0) => {
                            if !quit.is_cancelled() {
                                warn!("End of input on stdin, quitting");
                                quit.cancel();
                            }
                            break;
                        }
                        // Any bytes make a line; invalid UTF-8 is replaced
                        Ok(_) => {
                            let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                            queue.push(String::from_utf8_lossy(line));
                        }
                        Err(e) => {
                            if !quit.is_cancelled() {
                                warn!("Failed to read on stdin, quitting: {}", e);
                                quit.cancel();
                            }
                            break;
                        }
                    },
                }
            }
            debug!("Console reader ended");
        });

        (input, task)
    }

    /// Append one raw line
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(line);
    }

    /// Pop the next non-blank line, trimmed
    ///
    /// Blank lines are discarded. Returns `None` once the queue is empty.
    pub fn next_command(&self) -> Option<String> {
        loop {
            let raw = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()?;

            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
}
