use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{StorageBackend, StoreError, StoreMetadata, Tables};
use crate::models::{CachedEntity, EntityId, PendingOperation, SyncState};

/// Durable store for cached entities and the mutation queue.
///
/// Reads are served from memory. Every write serializes a full snapshot and
/// hands it to the backend while holding the lock; the new state only becomes
/// visible once the backend accepted it.
pub struct LocalStore {
    backend: Box<dyn StorageBackend>,
    tables: Mutex<Tables>,
}

impl LocalStore {
    /// Load the snapshot from `backend`, or start empty.
    pub fn open(backend: impl StorageBackend + 'static) -> Result<Self, StoreError> {
        let mut tables = match backend.load()? {
            Some(bytes) => serde_json::from_slice::<Tables>(&bytes)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            None => Tables::default(),
        };

        if tables.metadata.device_id.is_empty() {
            tables.metadata.device_id = format!("{:016x}", rand::random::<u64>());
            backend.save(&serde_json::to_vec(&tables)?)?;
        }

        info!(
            collections = tables.entities.len(),
            pending = tables.pending_operations.len(),
            "Local store opened"
        );

        Ok(Self {
            backend: Box::new(backend),
            tables: Mutex::new(tables),
        })
    }

    /// Run `f` against a copy of the tables and persist the result.
    /// On any error, in-memory state stays as it was.
    pub(crate) async fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Tables) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self.tables.lock().await;
        let mut staged = guard.clone();
        let out = f(&mut staged)?;

        let bytes = serde_json::to_vec(&staged).map_err(StoreError::from)?;
        if let Err(e) = self.backend.save(&bytes) {
            error!(error = %e, "Store write failed");
            return Err(e.into());
        }
        *guard = staged;
        Ok(out)
    }

    /// `transact` for infallible changes.
    pub(crate) async fn commit<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T, StoreError> {
        self.transact(|tables| Ok::<_, StoreError>(f(tables))).await
    }

    pub(crate) async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&*self.tables.lock().await)
    }

    // ===== Entities =====

    pub async fn get(&self, collection: &str, id: &EntityId) -> Option<CachedEntity> {
        self.read(|t| t.entity(collection, id).cloned()).await
    }

    pub async fn put(&self, entity: CachedEntity) -> Result<(), StoreError> {
        debug!(collection = %entity.collection, id = %entity.id, "Storing entity");
        self.commit(|t| {
            t.insert_entity(entity);
        })
        .await
    }

    pub async fn delete(&self, collection: &str, id: &EntityId) -> Result<Option<CachedEntity>, StoreError> {
        self.commit(|t| t.remove_entity(collection, id)).await
    }

    /// Row created under `client_id`, whether or not the server confirmed it yet.
    pub async fn find_by_client_id(&self, collection: &str, client_id: &str) -> Option<CachedEntity> {
        self.read(|t| t.find_by_client_id(collection, client_id).cloned())
            .await
    }

    /// Lazily yield the rows of `collection` accepted by `predicate`.
    ///
    /// Keys are captured when the stream is first polled; each row is read
    /// fresh, so rows removed meanwhile are skipped. Calling `scan` again
    /// starts over.
    pub fn scan<'a, P>(
        &'a self,
        collection: &str,
        predicate: P,
    ) -> impl Stream<Item = CachedEntity> + Send + 'a
    where
        P: Fn(&CachedEntity) -> bool + Send + 'a,
    {
        let collection = collection.to_string();
        stream::unfold(
            (None::<VecDeque<EntityId>>, collection, predicate),
            move |(keys, collection, predicate)| async move {
                let mut keys = match keys {
                    Some(keys) => keys,
                    None => self.keys(&collection).await,
                };
                loop {
                    let id = keys.pop_front()?;
                    if let Some(entity) = self.get(&collection, &id).await {
                        if predicate(&entity) {
                            return Some((entity, (Some(keys), collection, predicate)));
                        }
                    }
                }
            },
        )
    }

    async fn keys(&self, collection: &str) -> VecDeque<EntityId> {
        self.read(|t| {
            t.entities
                .get(collection)
                .map(|rows| rows.keys().cloned().collect())
                .unwrap_or_default()
        })
        .await
    }

    pub async fn collections(&self) -> Vec<String> {
        self.read(|t| t.entities.keys().cloned().collect()).await
    }

    pub async fn conflicts(&self) -> Vec<CachedEntity> {
        self.read(|t| {
            t.entities
                .values()
                .flat_map(|rows| rows.values())
                .filter(|e| e.sync_state == SyncState::Conflict)
                .cloned()
                .collect()
        })
        .await
    }

    // ===== Mutation queue =====

    /// All queued operations in op id order, failed ones included.
    pub async fn list_pending(&self) -> Vec<PendingOperation> {
        self.read(|t| t.pending_operations.values().cloned().collect())
            .await
    }

    /// Append `op` and return its assigned op id.
    pub async fn enqueue(&self, op: PendingOperation) -> Result<u64, StoreError> {
        let op_id = self.commit(|t| t.push_op(op)).await?;
        debug!(op_id, "Operation enqueued");
        Ok(op_id)
    }

    pub async fn dequeue(&self, op_id: u64) -> Result<Option<PendingOperation>, StoreError> {
        self.commit(|t| t.pending_operations.remove(&op_id)).await
    }

    pub async fn operation(&self, op_id: u64) -> Option<PendingOperation> {
        self.read(|t| t.pending_operations.get(&op_id).cloned())
            .await
    }

    pub async fn pending_count(&self) -> usize {
        self.read(|t| t.pending_operations.len()).await
    }

    // ===== Metadata =====

    pub async fn metadata(&self) -> StoreMetadata {
        self.read(|t| t.metadata.clone()).await
    }

    pub async fn device_id(&self) -> String {
        self.read(|t| t.metadata.device_id.clone()).await
    }

    pub async fn record_session(&self, completed_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.commit(|t| t.metadata.last_sync_session_at = Some(completed_at))
            .await
    }
}
