//! Single entry point for reads and writes.
//!
//! Writes always land in the local store first, together with the queued
//! operation that carries them, and only then is the network tried. A failed
//! or skipped transmission leaves the operation queued for the sync manager,
//! so callers never see transient network errors from a write.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use crate::conflict::Resolution;
use crate::engine::Shared;
use crate::error::{Result, SyncError};
use crate::models::{
    CachedEntity, EntityId, ListFilter, PendingOperation, RemoteRecord, SyncState, Target,
};
use crate::remote::{RemoteApi, RemoteError};

pub struct Gateway<R: RemoteApi> {
    shared: Arc<Shared<R>>,
}

impl<R: RemoteApi> Clone for Gateway<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn visible(entity: CachedEntity) -> Result<CachedEntity> {
    if entity.is_visible() {
        Ok(entity)
    } else {
        Err(SyncError::NotFound(entity.target().to_string()))
    }
}

impl<R: RemoteApi> Gateway<R> {
    pub(crate) fn new(shared: Arc<Shared<R>>) -> Self {
        Self { shared }
    }

    // ===== Reads =====

    /// Fetch one record, falling back to the cache when the server cannot be
    /// reached. Rows with local edits keep their local payload.
    pub async fn read(&self, collection: &str, id: impl Into<EntityId>) -> Result<CachedEntity> {
        let id = id.into();
        let target = Target::new(collection, id.clone());
        let store = &self.shared.store;

        if let Some(entity) = store.get(collection, &id).await {
            if entity.is_local_only() {
                // The server does not know this row yet
                return visible(entity);
            }
        }

        if self.shared.probe.is_online() {
            let fetched = self
                .shared
                .bounded(self.shared.remote.fetch(collection, &id))
                .await;
            match fetched {
                Ok(record) => {
                    let event = store.commit(|t| t.apply_remote(collection, &record)).await?;
                    self.shared.emit(event);
                    return visible(self.stored_row(collection, &record).await);
                }
                Err(RemoteError::NotFound(_)) => {
                    let event = store.commit(|t| t.drop_missing(collection, &id)).await?;
                    self.shared.emit(event);
                    return match store.get(collection, &id).await {
                        Some(entity) => visible(entity),
                        None => Err(SyncError::NotFound(target.to_string())),
                    };
                }
                Err(e) if e.is_transient() => {
                    debug!(entity = %target, error = %e, "Read falling back to cache");
                }
                Err(e) => return Err(e.into()),
            }
        }

        match store.get(collection, &id).await {
            Some(entity) => visible(entity),
            None => Err(SyncError::Unavailable(target.to_string())),
        }
    }

    /// The row a fetched record ended up in. A record still being created
    /// from this device lives under its client id.
    async fn stored_row(&self, collection: &str, record: &RemoteRecord) -> CachedEntity {
        if let Some(entity) = self.shared.store.get(collection, &record.id).await {
            return entity;
        }
        if let Some(client_id) = record.client_id.as_deref() {
            if let Some(entity) = self.shared.store.find_by_client_id(collection, client_id).await {
                return entity;
            }
        }
        CachedEntity::from_remote(collection, record)
    }

    /// List a collection. Online, the server's answer is merged into the cache
    /// and combined with local edits; offline, cached rows are filtered on
    /// top-level field equality.
    pub async fn list(&self, collection: &str, filter: &ListFilter) -> Result<Vec<CachedEntity>> {
        let store = &self.shared.store;

        if self.shared.probe.is_online() {
            let fetched = self
                .shared
                .bounded(self.shared.remote.list(collection, filter))
                .await;
            match fetched {
                Ok(records) => {
                    let events = store
                        .commit(|t| {
                            records
                                .iter()
                                .filter_map(|r| t.apply_remote(collection, r))
                                .collect::<Vec<_>>()
                        })
                        .await?;
                    self.shared.emit(events);

                    let listed: HashSet<EntityId> = records.into_iter().map(|r| r.id).collect();
                    let rows = store
                        .scan(collection, move |e| {
                            e.is_visible()
                                && (listed.contains(&e.id)
                                    || (e.sync_state != SyncState::Clean
                                        && filter.matches(&e.payload)))
                        })
                        .collect()
                        .await;
                    return Ok(rows);
                }
                Err(e) if e.is_transient() => {
                    debug!(collection, error = %e, "List falling back to cache");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !store.collections().await.iter().any(|c| c == collection) {
            return Err(SyncError::Unavailable(collection.to_string()));
        }
        Ok(store
            .scan(collection, |e| e.is_visible() && filter.matches(&e.payload))
            .collect()
            .await)
    }

    // ===== Writes =====

    /// Create a record. The returned row is keyed by the server id when the
    /// create went through right away, by its `tmp-N` client id otherwise.
    pub async fn create(&self, collection: &str, payload: Value) -> Result<CachedEntity> {
        let now = self.shared.clock.now();
        let staged = self
            .shared
            .store
            .commit(|t| t.stage_create(collection, payload, now))
            .await?;
        self.shared.emit(staged.events);
        let entity = staged.entity;
        debug!(collection, client_id = %entity.id, "Create staged");

        self.try_transmit(staged.op_id).await?;
        let client_id = entity.id.as_str().to_string();
        Ok(self
            .shared
            .store
            .find_by_client_id(collection, &client_id)
            .await
            .unwrap_or(entity))
    }

    /// Apply a merge patch. Editing a row that was never cached queues the
    /// patch against a placeholder.
    pub async fn update(
        &self,
        collection: &str,
        id: impl Into<EntityId>,
        patch: Value,
    ) -> Result<CachedEntity> {
        let id = id.into();
        let now = self.shared.clock.now();
        let staged = self
            .shared
            .store
            .transact(|t| t.stage_update(collection, &id, &patch, now))
            .await?;
        self.shared.emit(staged.events);
        debug!(collection, id = %id, "Update staged");

        if let Some(op_id) = staged.op_id {
            self.try_transmit(op_id).await?;
        }
        match self.current_row(collection, &id).await {
            Some(entity) => Ok(entity),
            None => staged
                .entity
                .ok_or_else(|| SyncError::NotFound(Target::new(collection, id).to_string())),
        }
    }

    /// Remove a record. A record whose create never left the device is
    /// dropped without contacting the server.
    pub async fn remove(&self, collection: &str, id: impl Into<EntityId>) -> Result<()> {
        let id = id.into();
        let now = self.shared.clock.now();
        let staged = self
            .shared
            .store
            .transact(|t| t.stage_remove(collection, &id, now))
            .await?;
        self.shared.emit(staged.events);
        debug!(collection, id = %id, queued = staged.op_id.is_some(), "Remove staged");

        if let Some(op_id) = staged.op_id {
            self.try_transmit(op_id).await?;
        }
        Ok(())
    }

    /// Settle an entity left in CONFLICT. Returns the row afterwards, `None`
    /// when it no longer exists.
    pub async fn resolve_conflict(
        &self,
        collection: &str,
        id: impl Into<EntityId>,
        resolution: Resolution,
    ) -> Result<Option<CachedEntity>> {
        let id = id.into();
        let now = self.shared.clock.now();
        let staged = self
            .shared
            .store
            .transact(|t| t.stage_resolution(collection, &id, resolution, now))
            .await?;
        self.shared.emit(staged.events);
        debug!(collection, id = %id, ?resolution, "Conflict resolved");

        let Some(entity) = staged.entity else {
            return Ok(None);
        };
        if let Some(op_id) = staged.op_id {
            self.try_transmit(op_id).await?;
        }
        Ok(self
            .current_row(collection, &entity.id)
            .await
            .or(Some(entity)))
    }

    /// Where a row lives now: under `id`, or under the server id if `id` was
    /// a client id whose create has been acknowledged.
    async fn current_row(&self, collection: &str, id: &EntityId) -> Option<CachedEntity> {
        match self.shared.store.get(collection, id).await {
            Some(entity) => Some(entity),
            None => {
                self.shared
                    .store
                    .find_by_client_id(collection, id.as_str())
                    .await
            }
        }
    }

    // ===== Failed operations =====

    /// Operations that exhausted their retries or were rejected by the server.
    pub async fn failed_operations(&self) -> Vec<PendingOperation> {
        self.shared
            .store
            .list_pending()
            .await
            .into_iter()
            .filter(PendingOperation::is_failed)
            .collect()
    }

    /// Put a failed operation back in the queue with a fresh attempt budget.
    pub async fn retry_failed(&self, op_id: u64) -> Result<()> {
        self.shared
            .store
            .transact(|t| t.requeue_failed(op_id))
            .await?;
        debug!(op_id, "Failed operation requeued");
        self.try_transmit(op_id).await
    }

    /// Drop a failed operation and everything queued after it for the same
    /// record; the row returns to server state.
    pub async fn discard_failed(&self, op_id: u64) -> Result<()> {
        let events = self
            .shared
            .store
            .transact(|t| t.discard_failed(op_id))
            .await?;
        debug!(op_id, "Failed operation discarded");
        self.shared.emit(events);
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.store.pending_count().await
    }

    pub async fn conflicts(&self) -> Vec<CachedEntity> {
        self.shared.store.conflicts().await
    }

    /// Send a freshly queued op right away when online and nothing else for
    /// its target is queued ahead of it or in flight.
    async fn try_transmit(&self, op_id: u64) -> Result<()> {
        if !self.shared.probe.is_online() {
            debug!(op_id, "Offline, operation stays queued");
            return Ok(());
        }

        let now = self.shared.clock.now();
        let ready = self
            .shared
            .store
            .read(|t| {
                t.pending_operations
                    .get(&op_id)
                    .filter(|op| op.is_due(now) && t.is_head(op_id))
                    .map(PendingOperation::target)
            })
            .await;
        let Some((target, claim)) = ready.and_then(|target| {
            let claim = self.shared.inflight.try_claim(target.clone())?;
            Some((target, claim))
        }) else {
            debug!(op_id, "Queued behind earlier work");
            self.shared.wake.notify_one();
            return Ok(());
        };

        let outcome = self.shared.replay(op_id).await?;
        drop(claim);
        debug!(op_id, ?outcome, "Immediate transmission");

        // Writes queued behind this one during the send were left to the drain
        if self.shared.store.read(|t| t.has_ops_for(&target)).await {
            self.shared.wake.notify_one();
        }
        Ok(())
    }
}
