//! Content store seam and its implementations.
//!
//! ```text
//! ┌─────────────────────┐   load / save    ┌──────────────────────────────┐
//! │ PersistenceScheduler│ ───────────────► │ dyn ContentStore             │
//! │ (timeouts, debounce)│                  ├──────────────────────────────┤
//! └─────────────────────┘                  │ MemoryStore   (in-process)   │
//!                                          │ DocumentStore (RocksDB)      │
//!                                          │   CF "documents" snapshots   │
//!                                          │   CF "metadata"  bookkeeping │
//!                                          └──────────────────────────────┘
//! ```
//!
//! A store only moves opaque snapshot bytes. Timeouts and retry policy belong
//! to the persistence scheduler.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

use async_trait::async_trait;
use thiserror::Error;

/// Durable home of document snapshots.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Latest snapshot of `document`, or `None` if it was never saved.
    async fn load(&self, document: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the snapshot of `document`.
    async fn save(&self, document: &str, snapshot: &[u8]) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}
