//! Connection framer.
//!
//! Reassembles the byte stream of one connection into complete requests.
//! The transport may split or coalesce writes anywhere, including between
//! the `\r` and `\n` of a delimiter, so bytes are accumulated until a full
//! line is present. A `set` is a two-line unit: its header moves the framer
//! into [`FrameState::AwaitingValue`] and the next line, whatever it contains,
//! becomes the value. A `set` header with the right shape but unusable fields
//! still owns the following line: it is read and thrown away.

use crate::protocol::{find_crlf, remove_backspaces, Command, ParseError, Parser, DELIMITER};
use bytes::BytesMut;

/// Initial capacity of a connection's receive buffer
const BUFFER_SIZE: usize = 16 * 1024;

/// A `set` header waiting for its value line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSet {
    pub key: String,
    pub flags: u32,
    pub exptime: i64,
    pub bytes: usize,
}

/// Where the framer is within the current protocol unit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    AwaitingCommand,
    AwaitingValue(PendingSet),
    /// A rejected `set` header; its value line is dropped when it arrives
    DiscardingValue { line: String, error: ParseError },
}

/// A complete unit ready to be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get {
        key: String,
    },
    Set {
        key: String,
        flags: u32,
        exptime: i64,
        bytes: usize,
        value: String,
    },
    /// A `set` whose header fields were invalid, value already consumed
    Rejected {
        line: String,
        error: ParseError,
    },
    Malformed {
        line: String,
        error: ParseError,
    },
}

/// Per-connection byte accumulator and unit state machine.
#[derive(Debug)]
pub struct Framer {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already searched for a delimiter
    scanned: usize,
    state: FrameState,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            scanned: 0,
            state: FrameState::AwaitingCommand,
        }
    }

    /// Buffer that socket reads append into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append received bytes.
    #[cfg(test)]
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn state(&self) -> &FrameState {
        &self.state
    }

    /// Bytes received but not yet part of a complete line
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete request out of the buffer.
    ///
    /// Returns `None` once no complete unit remains; any partial line stays
    /// buffered, and a `set` header without its value stays pending.
    pub fn next_request(&mut self) -> Option<Request> {
        loop {
            let line = self.next_line()?;

            match std::mem::take(&mut self.state) {
                FrameState::AwaitingValue(pending) => {
                    return Some(Request::Set {
                        key: pending.key,
                        flags: pending.flags,
                        exptime: pending.exptime,
                        bytes: pending.bytes,
                        value: line,
                    });
                }
                FrameState::DiscardingValue { line, error } => {
                    return Some(Request::Rejected { line, error });
                }
                FrameState::AwaitingCommand => match Parser::parse(&line) {
                    Command::Get { key } => return Some(Request::Get { key }),
                    Command::SetHeader {
                        key,
                        flags,
                        exptime,
                        bytes,
                    } => {
                        self.state = FrameState::AwaitingValue(PendingSet {
                            key,
                            flags,
                            exptime,
                            bytes,
                        });
                    }
                    Command::RejectedSet(error) => {
                        self.state = FrameState::DiscardingValue { line, error };
                    }
                    Command::Malformed(error) => return Some(Request::Malformed { line, error }),
                },
            }
        }
    }

    /// Split off one delimited line, sanitized and without its delimiter.
    ///
    /// Searching resumes one byte before the previous scan ended, so a `\r`
    /// left at the tail is still paired with a `\n` that arrives later.
    fn next_line(&mut self) -> Option<String> {
        let start = self.scanned.saturating_sub(1);
        let end = match find_crlf(&self.buffer[start..]) {
            Some(pos) => start + pos,
            None => {
                self.scanned = self.buffer.len();
                return None;
            }
        };
        self.scanned = 0;
        let raw = self.buffer.split_to(end + DELIMITER.len());
        let cleaned = remove_backspaces(&raw[..end]);
        Some(String::from_utf8_lossy(&cleaned).into_owned())
    }
}
