//! Durable local storage for cached entities and the mutation queue.
//!
//! Everything lives in one snapshot document (`entities`, `pendingOperations`,
//! `metadata`) so that composite changes - an entity edit together with the
//! operation that carries it to the server - are committed atomically.
//! Writes go through a single async lock; a failed write leaves the in-memory
//! state untouched.

pub mod backend;
pub mod local;
mod queue;
mod tables;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use local::LocalStore;
pub use tables::StoreMetadata;
pub(crate) use queue::Ack;
pub(crate) use tables::Tables;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage quota exceeded: {needed} bytes needed, {quota} available")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("Failed to serialize store snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store snapshot: {0}")]
    Corrupt(String),
}
