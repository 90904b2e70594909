//! TCP listener for memcached-lite connections.
//!
//! Accepts connections and runs one session task per socket. Sessions share
//! nothing but the store guard.

use crate::config::Config;
use crate::session::{Session, SessionOptions};
use crate::storage::{Document, StoreGuard};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, Instrument};

/// Server instance
pub struct Server {
    listener: TcpListener,
    guard: Arc<StoreGuard>,
    options: SessionOptions,
}

impl Server {
    /// Bind the listener and open the store document
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        let guard = StoreGuard::new(Document::new(config.store_path.clone()), config.max_delay);

        Ok(Server {
            listener,
            guard,
            options: SessionOptions {
                greeting: config.greeting,
                on_malformed: config.on_malformed,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> io::Result<()> {
        info!(address = %self.local_addr()?, "Server listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "Client connected");

                    let session = Session::new(stream, Arc::clone(&self.guard), self.options);
                    tokio::spawn(
                        async move {
                            match session.run().await {
                                Ok(()) => info!("Client disconnected"),
                                Err(e) => error!(error = %e, "Client error"),
                            }
                        }
                        .instrument(tracing::info_span!("connection", %peer)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Get a reference to the store guard for testing
    #[cfg(test)]
    pub fn guard(&self) -> &Arc<StoreGuard> {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::MalformedPolicy;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(greeting: bool, max_delay: Duration) -> (TempDir, SocketAddr, Arc<StoreGuard>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            store_path: dir.path().join("kvstore.json"),
            greeting,
            max_delay,
            on_malformed: MalformedPolicy::Silent,
            log_level: "info".to_string(),
        };

        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let guard = Arc::clone(server.guard());
        tokio::spawn(server.run());
        (dir, addr, guard)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_dir, addr, _) = start(true, Duration::ZERO).await;
        let mut client = Client::connect(addr, true).await.unwrap();

        assert_eq!(client.set("k", "v").await.unwrap(), "STORED \r\n");
        assert_eq!(client.get("k").await.unwrap(), "VALUE k 1\r\nv\r\nEND\r\n");

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_miss_on_empty_store() {
        let (_dir, addr, _) = start(false, Duration::ZERO).await;
        let mut client = Client::connect(addr, false).await.unwrap();

        assert_eq!(client.get("absent").await.unwrap(), "null\r\n");
    }

    #[tokio::test]
    async fn test_pipelining_single_write() {
        let (_dir, addr, _) = start(false, Duration::ZERO).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(b"set a 1 100 3\r\nxyz\r\nget a\r\n")
            .await
            .unwrap();

        let expected: &[u8] = b"STORED \r\nVALUE a 3\r\nxyz\r\nEND\r\n";
        let mut reply = vec![0u8; expected.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_values_survive_reconnect() {
        let (_dir, addr, _) = start(false, Duration::ZERO).await;

        let mut first = Client::connect(addr, false).await.unwrap();
        first.set("address", "Bloomington, Indiana").await.unwrap();
        first.set("address", "Chicago, Illinois").await.unwrap();
        first.disconnect().await.unwrap();

        let mut second = Client::connect(addr, false).await.unwrap();
        assert_eq!(
            second.get("address").await.unwrap(),
            "VALUE address 17\r\nChicago, Illinois\r\nEND\r\n"
        );
    }

    #[tokio::test]
    async fn test_interleaved_connections() {
        let (_dir, addr, _) = start(false, Duration::from_millis(20)).await;
        let values = ["Anurag", "Hanuman", "Ganesha"];

        let mut handles = Vec::new();
        for value in values {
            handles.push(tokio::spawn(async move {
                let mut client = Client::connect(addr, false).await.unwrap();
                assert_eq!(client.set("name", value).await.unwrap(), "STORED \r\n");
                client.get("name").await.unwrap()
            }));
        }

        for handle in handles {
            let reply = handle.await.unwrap();
            let matched = values.iter().any(|value| {
                reply == format!("VALUE name {}\r\n{}\r\nEND\r\n", value.len(), value)
            });
            assert!(matched, "unexpected reply {:?}", reply);
        }
    }

    #[tokio::test]
    async fn test_concurrent_sets_same_key() {
        let (dir, addr, guard) = start(false, Duration::from_millis(5)).await;
        let values: Vec<String> = (0..8).map(|i| format!("writer-{i}")).collect();

        let mut handles = Vec::new();
        for value in values.clone() {
            handles.push(tokio::spawn(async move {
                let mut client = Client::connect(addr, false).await.unwrap();
                client.set("shared", &value).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "STORED \r\n");
        }

        let record = guard.get("shared").await.unwrap().unwrap();
        assert!(values.contains(&record.value));

        let raw = tokio::fs::read_to_string(dir.path().join("kvstore.json"))
            .await
            .unwrap();
        let store: crate::storage::Store = serde_json::from_str(&raw).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_does_not_affect_others() {
        let (_dir, addr, _) = start(false, Duration::ZERO).await;

        let mut dropped = TcpStream::connect(addr).await.unwrap();
        dropped.write_all(b"set k 5\r\nhel").await.unwrap();
        drop(dropped);

        let mut client = Client::connect(addr, false).await.unwrap();
        assert_eq!(client.get("k").await.unwrap(), "null\r\n");
        assert_eq!(client.set("k", "fine").await.unwrap(), "STORED \r\n");
    }
}
