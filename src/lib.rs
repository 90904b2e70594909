//! memcached-lite: a small memcached-inspired key-value server.
//!
//! Clients speak a line-oriented text protocol over TCP:
//! - `set <key> [<flags> <exptime>] <bytes>\r\n<value>\r\n`
//! - `get <key>\r\n`
//!
//! Values live in a single JSON document on disk. Every store operation
//! goes through one lock, so concurrent connections never interleave inside
//! a read-modify-write of that document.

pub mod client;
pub mod config;
pub mod framer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

pub use client::Client;
pub use config::Config;
pub use server::Server;
pub use storage::{Record, StoreGuard};
