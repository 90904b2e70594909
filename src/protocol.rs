//! memcached-lite text protocol: command interpretation and reply generation.
//!
//! The framer hands this module one line at a time, already stripped of its
//! `\r\n` delimiter. Two verbs are understood:
//! - `get <key>`
//! - `set <key> <bytes>` or `set <key> <flags> <exptime> <bytes>`
//!
//! A `set` header is followed by a value line which the framer collects; this
//! module never sees it as a command.

use bytes::BytesMut;
use thiserror::Error;

/// Line delimiter on the wire.
pub const DELIMITER: &[u8] = b"\r\n";

/// Maximum key length, same as memcached.
pub const MAX_KEY_LENGTH: usize = 250;

/// Flags applied by the short `set <key> <bytes>` form.
pub const DEFAULT_FLAGS: u32 = 0;

/// Expiration time applied by the short `set <key> <bytes>` form.
pub const DEFAULT_EXPTIME: i64 = 100;

const BACKSPACE: u8 = 0x08;

const GREETING: &[u8] = b"Welcome to Memcached-lite!\r\n\
Use 'set' to store key-value pairs\r\n\
Use 'get' to retrieve the value of a key\r\n\
Get ready for a cache-tastic experience!\r\n\r\n";

/// Interpreted command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch a single key
    Get { key: String },

    /// Header of a store; the value arrives on the next line
    SetHeader {
        key: String,
        flags: u32,
        exptime: i64,
        bytes: usize,
    },

    /// A `set` with the right token count but an unusable field. Its value
    /// line still follows and must be consumed.
    RejectedSet(ParseError),

    /// Unknown verb or wrong token count
    Malformed(ParseError),
}

/// Reasons a command line is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{verb} expects {expected} tokens, got {got}")]
    WrongArity {
        verb: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("key too long: {0} bytes")]
    KeyTooLong(usize),
    #[error("invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Parser for memcached-lite command lines
pub struct Parser;

impl Parser {
    /// Classify a single command line (delimiter already removed).
    pub fn parse(line: &str) -> Command {
        match Self::try_parse(line) {
            Ok(command) => command,
            Err(e) => Command::Malformed(e),
        }
    }

    fn try_parse(line: &str) -> Result<Command, ParseError> {
        let parts: Vec<&str> = line.split_ascii_whitespace().collect();
        let Some(verb) = parts.first() else {
            return Err(ParseError::Empty);
        };

        match verb.to_ascii_lowercase().as_str() {
            "get" => Self::parse_get(&parts),
            "set" => Self::parse_set(&parts),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }

    /// Parse `get <key>`
    fn parse_get(parts: &[&str]) -> Result<Command, ParseError> {
        if parts.len() != 2 {
            return Err(ParseError::WrongArity {
                verb: "get",
                expected: "2",
                got: parts.len(),
            });
        }

        Ok(Command::Get {
            key: validate_key(parts[1])?,
        })
    }

    /// Parse `set <key> <bytes>` or `set <key> <flags> <exptime> <bytes>`
    ///
    /// Only a wrong token count is an error here; once the shape is right a
    /// value line follows, so field errors become [`Command::RejectedSet`].
    fn parse_set(parts: &[&str]) -> Result<Command, ParseError> {
        let header = match *parts {
            [_, key, bytes] => Self::set_fields(key, None, bytes),
            [_, key, flags, exptime, bytes] => {
                Self::set_fields(key, Some((flags, exptime)), bytes)
            }
            _ => {
                return Err(ParseError::WrongArity {
                    verb: "set",
                    expected: "3 or 5",
                    got: parts.len(),
                })
            }
        };

        Ok(header.unwrap_or_else(Command::RejectedSet))
    }

    fn set_fields(
        key: &str,
        flags_exptime: Option<(&str, &str)>,
        bytes: &str,
    ) -> Result<Command, ParseError> {
        let (flags, exptime) = match flags_exptime {
            Some((flags, exptime)) => (
                parse_number("flags", flags)?,
                parse_number("exptime", exptime)?,
            ),
            None => (DEFAULT_FLAGS, DEFAULT_EXPTIME),
        };

        Ok(Command::SetHeader {
            key: validate_key(key)?,
            flags,
            exptime,
            bytes: parse_number("bytes", bytes)?,
        })
    }
}

fn validate_key(key: &str) -> Result<String, ParseError> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(ParseError::KeyTooLong(key.len()));
    }
    Ok(key.to_string())
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Collapse keystroke corrections: every backspace byte deletes itself and
/// the byte before it. A backspace with nothing before it is dropped.
pub fn remove_backspaces(line: &[u8]) -> Vec<u8> {
    let mut cleaned = Vec::with_capacity(line.len());
    for &byte in line {
        if byte == BACKSPACE {
            cleaned.pop();
        } else {
            cleaned.push(byte);
        }
    }
    cleaned
}

/// Position of the first `\r\n` in `buffer`
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

/// Reply generator for memcached-lite
pub struct Response;

impl Response {
    /// Fetch hit: `VALUE <key> <length>\r\n<value>\r\nEND\r\n`
    pub fn value(key: &str, data: &[u8]) -> BytesMut {
        let header = format!("VALUE {} {}\r\n", key, data.len());
        let mut response = BytesMut::with_capacity(header.len() + data.len() + 7);
        response.extend_from_slice(header.as_bytes());
        response.extend_from_slice(data);
        response.extend_from_slice(DELIMITER);
        response.extend_from_slice(Self::end());
        response
    }

    pub fn end() -> &'static [u8] {
        b"END\r\n"
    }

    /// Fetch miss
    pub fn miss() -> &'static [u8] {
        b"null\r\n"
    }

    pub fn stored() -> &'static [u8] {
        b"STORED \r\n"
    }

    pub fn not_stored() -> &'static [u8] {
        b"NOT-STORED \r\n"
    }

    /// Fetch failed because the store could not be read
    pub fn server_error() -> &'static [u8] {
        b"Internal Server Error \r\n"
    }

    /// Reply to a malformed line when the session is configured to answer one
    pub fn error() -> &'static [u8] {
        b"ERROR\r\n"
    }

    /// Banner written once when a connection opens
    pub fn greeting() -> &'static [u8] {
        GREETING
    }
}
