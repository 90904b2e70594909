//! Connection session.
//!
//! Drives one client: reads from the socket into the framer, executes each
//! complete request against the store guard, and writes replies back in
//! arrival order.

use crate::config::MalformedPolicy;
use crate::framer::{FrameState, Framer, Request};
use crate::protocol::Response;
use crate::storage::{Record, StoreGuard};
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace, warn};

/// Per-connection behaviour taken from the server configuration
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Write the greeting banner when the session starts
    pub greeting: bool,
    pub on_malformed: MalformedPolicy,
}

/// A single client connection
pub struct Session<S> {
    stream: S,
    framer: Framer,
    guard: Arc<StoreGuard>,
    options: SessionOptions,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, guard: Arc<StoreGuard>, options: SessionOptions) -> Self {
        Self {
            stream,
            framer: Framer::new(),
            guard,
            options,
        }
    }

    /// Serve the connection until the peer closes it.
    ///
    /// Only transport faults are returned; store failures become replies.
    pub async fn run(mut self) -> io::Result<()> {
        if self.options.greeting {
            self.stream.write_all(Response::greeting()).await?;
        }

        loop {
            let n = self.stream.read_buf(self.framer.buffer_mut()).await?;
            if n == 0 {
                if let FrameState::AwaitingValue(pending) = self.framer.state() {
                    debug!(key = %pending.key, "Connection closed with a pending set");
                }
                trace!("Connection closed by client");
                return Ok(());
            }

            while let Some(request) = self.framer.next_request() {
                trace!(?request, "Processing request");
                if let Some(response) = execute(request, &self.guard, self.options).await {
                    self.stream.write_all(&response).await?;
                }
            }
        }
    }
}

/// Execute a complete request, producing the reply to send, if any
async fn execute(
    request: Request,
    guard: &StoreGuard,
    options: SessionOptions,
) -> Option<BytesMut> {
    match request {
        Request::Get { key } => Some(match guard.get(&key).await {
            Ok(Some(record)) => Response::value(&key, record.value.as_bytes()),
            Ok(None) => BytesMut::from(Response::miss()),
            Err(e) => {
                error!(error = %e, %key, "Fetch failed");
                BytesMut::from(Response::server_error())
            }
        }),

        Request::Set {
            key,
            flags,
            exptime,
            bytes,
            value,
        } => {
            let record = Record {
                flags,
                exptime,
                bytes,
                value,
            };
            Some(BytesMut::from(match guard.set(key, record).await {
                Ok(()) => Response::stored(),
                Err(e) => {
                    error!(error = %e, "Store failed");
                    Response::not_stored()
                }
            }))
        }

        Request::Rejected { line, error } => {
            warn!(%error, %line, "Rejected set, value discarded");
            Some(BytesMut::from(match options.on_malformed {
                MalformedPolicy::Silent => Response::not_stored(),
                MalformedPolicy::Error => Response::error(),
            }))
        }

        Request::Malformed { line, error } => {
            warn!(%error, %line, "Malformed command");
            match options.on_malformed {
                MalformedPolicy::Silent => None,
                MalformedPolicy::Error => Some(BytesMut::from(Response::error())),
            }
        }
    }
}
