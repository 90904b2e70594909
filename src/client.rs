//! Minimal client for memcached-lite.
//!
//! Writes one request at a time and resolves once the complete reply is in
//! the accumulated response buffer. Used by tests and scripts.

use crate::protocol::{find_crlf, Response, DELIMITER};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// End of the greeting banner
const GREETING_END: &[u8] = b"\r\n\r\n";

/// Client-side failures
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before the reply was complete")]
    Closed,
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// A connection to a memcached-lite server
pub struct Client {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Client {
    /// Connect, consuming the greeting banner when the server sends one.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        expect_greeting: bool,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Client {
            stream,
            buffer: BytesMut::with_capacity(4096),
        };

        if expect_greeting {
            let end = client
                .fill_until(|buf| find(buf, GREETING_END).map(|pos| pos + GREETING_END.len()))
                .await?;
            client.buffer.advance(end);
        }

        Ok(client)
    }

    /// Store `value` under `key` and return the reply line.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<String, ClientError> {
        let header = format!("set {} 0 0 {}\r\n", key, value.len());
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(value.as_bytes()).await?;
        self.stream.write_all(DELIMITER).await?;

        self.take_reply(|buf| find_crlf(buf).map(|pos| pos + DELIMITER.len()))
            .await
    }

    /// Fetch `key` and return the whole reply, `VALUE` block or `null` line.
    pub async fn get(&mut self, key: &str) -> Result<String, ClientError> {
        self.stream
            .write_all(format!("get {}\r\n", key).as_bytes())
            .await?;

        let header_end = self.fill_until(find_crlf).await?;
        let header = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();

        if !header.starts_with("VALUE ") {
            return self
                .take_reply(|buf| find_crlf(buf).map(|pos| pos + DELIMITER.len()))
                .await;
        }

        let length: usize = header
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ClientError::UnexpectedReply(header.clone()))?;

        // header \r\n value \r\n END\r\n
        let total =
            header_end + DELIMITER.len() + length + DELIMITER.len() + Response::end().len();
        self.take_reply(|buf| (buf.len() >= total).then_some(total)).await
    }

    /// Close the write half and wait for the server to close its side.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        let mut rest = Vec::new();
        self.stream.read_to_end(&mut rest).await?;
        Ok(())
    }

    /// Read until `complete` reports the reply length, then split it off.
    async fn take_reply<F>(&mut self, complete: F) -> Result<String, ClientError>
    where
        F: Fn(&[u8]) -> Option<usize>,
    {
        let end = self.fill_until(complete).await?;
        let reply = self.buffer.split_to(end);
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    async fn fill_until<F>(&mut self, complete: F) -> Result<usize, ClientError>
    where
        F: Fn(&[u8]) -> Option<usize>,
    {
        loop {
            if let Some(end) = complete(&self.buffer[..]) {
                return Ok(end);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(ClientError::Closed);
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Accept one connection, read a request line, answer with `reply`, then
    /// close.
    async fn scripted_server(reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = BytesMut::new();
            while find_crlf(&request).is_none() {
                if stream.read_buf(&mut request).await.unwrap() == 0 {
                    return;
                }
            }
            stream.write_all(reply).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_get_unparseable_value_length() {
        let addr = scripted_server(b"VALUE k x\r\nv\r\nEND\r\n").await;
        let mut client = Client::connect(addr, false).await.unwrap();

        match client.get("k").await {
            Err(ClientError::UnexpectedReply(header)) => assert_eq!(header, "VALUE k x"),
            other => panic!("Expected UnexpectedReply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_closed_mid_reply() {
        let addr = scripted_server(b"VALUE k 5\r\nhel").await;
        let mut client = Client::connect(addr, false).await.unwrap();

        assert!(matches!(client.get("k").await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_get_miss_line() {
        let addr = scripted_server(b"null\r\n").await;
        let mut client = Client::connect(addr, false).await.unwrap();

        assert_eq!(client.get("k").await.unwrap(), "null\r\n");
    }

    #[tokio::test]
    async fn test_connect_without_greeting_arriving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"Welcome\r\n").await.unwrap();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), Client::connect(addr, true))
            .await
            .expect("connect should not hang when the server closes");
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_consumes_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(Response::greeting()).await.unwrap();
            let mut request = BytesMut::new();
            while find_crlf(&request).is_none() {
                if stream.read_buf(&mut request).await.unwrap() == 0 {
                    return;
                }
            }
            stream.write_all(b"null\r\n").await.unwrap();
        });

        let mut client = Client::connect(addr, true).await.unwrap();
        assert_eq!(client.get("k").await.unwrap(), "null\r\n");
    }
}
