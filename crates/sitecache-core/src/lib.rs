//! Sitecache Core Library
//!
//! Offline-first cache and sync engine for a REST API of versioned records.
//! Front ends read and write through the [`Gateway`]; writes land in the
//! [`LocalStore`] together with a queued operation and are replayed by the
//! [`SyncManager`] whenever the [`NetworkProbe`] reports the server reachable.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sitecache_core::{HttpRemote, LocalStore, MemoryBackend, SyncEngine};
//!
//! # async fn demo() -> sitecache_core::Result<()> {
//! let store = LocalStore::open(MemoryBackend::new())?;
//! let remote = HttpRemote::new("https://api.example.com/v1/", &store.device_id().await, std::time::Duration::from_secs(10))?;
//! let engine = SyncEngine::builder(store, Arc::new(remote)).build();
//! let _tasks = engine.spawn_background();
//! let batch = engine.gateway().create("batches", serde_json::json!({"status": "poured"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod models;
pub mod probe;
pub mod remote;
pub mod store;
pub mod sync;
pub mod utils;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use conflict::{ConflictContext, ConflictPolicy, LastWriteWins, Resolution, ServerWins, Verdict};
pub use engine::{BackgroundTasks, EngineBuilder, SyncEngine};
pub use error::{Result, SyncError};
pub use gateway::Gateway;
pub use models::{
    CachedEntity, EntityId, ListFilter, OpKind, OpStatus, PendingOperation, RemoteRecord,
    SessionOutcome, SyncEvent, SyncSession, SyncState, Target,
};
pub use probe::NetworkProbe;
pub use remote::{Fault, HttpRemote, InMemoryRemote, RemoteApi, RemoteError};
pub use store::{FileBackend, LocalStore, MemoryBackend, StorageBackend, StoreError, StoreMetadata};
pub use sync::{SyncManager, SyncPhase};
