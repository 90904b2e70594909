//! Persistent storage: one JSON document holding every record.
//!
//! The document on disk is the only source of truth. Every operation loads
//! it, works on the in-memory copy, and rewrites it in full. `StoreGuard`
//! serializes those read-modify-write cycles across all connections; nothing
//! else in the server touches the document.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

/// A stored value and the metadata sent with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque client flags
    pub flags: u32,
    /// Expiration time as declared by the client; stored, never enforced
    pub exptime: i64,
    /// Declared length of `value`
    pub bytes: usize,
    pub value: String,
}

/// Every record, keyed by cache key
pub type Store = BTreeMap<String, Record>;

/// The store document could not be read or written
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read store document '{}': {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse store document '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode store document: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to write store document '{}': {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// The on-disk JSON document
#[derive(Debug, Clone)]
pub struct Document {
    path: PathBuf,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole store.
    ///
    /// A missing or blank document is an empty store.
    pub async fn read(&self) -> Result<Store, StorageError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Store document missing, starting empty");
                return Ok(Store::new());
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if contents.trim().is_empty() {
            return Ok(Store::new());
        }

        serde_json::from_str(&contents).map_err(|source| StorageError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Overwrite the document with `store`.
    pub async fn write(&self, store: &Store) -> Result<(), StorageError> {
        let encoded = serde_json::to_string_pretty(store).map_err(StorageError::Encode)?;
        tokio::fs::write(&self.path, encoded)
            .await
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// Serializes every store operation behind one process-wide lock.
///
/// Callers never see the lock itself; they hand an operation to
/// [`StoreGuard::with_exclusive_access`] or [`StoreGuard::read_exclusive`]
/// and the guard runs it between a fresh `read()` and, for mutations, a
/// `write()`. The lock is released when the call returns, whether or not
/// the document could be read or written.
pub struct StoreGuard {
    document: Mutex<Document>,
    /// Upper bound of the random pause taken inside the critical section.
    /// Zero disables it.
    max_delay: Duration,
}

impl StoreGuard {
    /// Create a new guard over `document`
    pub fn new(document: Document, max_delay: Duration) -> Arc<Self> {
        info!(
            path = %document.path().display(),
            max_delay_ms = max_delay.as_millis() as u64,
            "Initializing store"
        );
        Arc::new(Self {
            document: Mutex::new(document),
            max_delay,
        })
    }

    /// Read the store, apply `operation`, write the result back.
    pub async fn with_exclusive_access<F, R>(&self, operation: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Store) -> R,
    {
        let document = self.document.lock().await;
        self.perturb().await;

        let mut store = document.read().await?;
        let result = operation(&mut store);
        document.write(&store).await?;

        Ok(result)
    }

    /// Read the store and apply `operation` without rewriting the document.
    pub async fn read_exclusive<F, R>(&self, operation: F) -> Result<R, StorageError>
    where
        F: FnOnce(&Store) -> R,
    {
        let document = self.document.lock().await;
        self.perturb().await;

        let store = document.read().await?;
        Ok(operation(&store))
    }

    /// Insert or replace the record under `key`
    pub async fn set(&self, key: String, record: Record) -> Result<(), StorageError> {
        trace!(%key, bytes = record.bytes, "Storing record");
        self.with_exclusive_access(move |store| {
            store.insert(key, record);
        })
        .await
    }

    /// Fetch the record under `key`
    pub async fn get(&self, key: &str) -> Result<Option<Record>, StorageError> {
        trace!(key, "Fetching record");
        self.read_exclusive(|store| store.get(key).cloned()).await
    }

    /// Random pause that makes cross-connection interleaving observable.
    async fn perturb(&self) {
        let max = self.max_delay.as_millis() as u64;
        if max == 0 {
            return;
        }
        let delay = rand::thread_rng().gen_range(0..=max);
        trace!(delay_ms = delay, "Delaying inside critical section");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}
