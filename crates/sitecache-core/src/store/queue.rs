//! Composite queue transitions. Each method runs inside one store commit, so
//! an entity and the operations that carry it move together or not at all.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::Tables;
use crate::conflict::Resolution;
use crate::error::SyncError;
use crate::models::{
    CachedEntity, EntityId, OpKind, OpStatus, PendingOperation, RemoteRecord, SyncEvent,
    SyncState, Target,
};
use crate::utils::{merge_diff, merge_patch};

/// What the server confirmed for a transmitted operation.
#[derive(Debug, Clone)]
pub(crate) enum Ack {
    Record(RemoteRecord),
    Deleted,
}

/// Outcome of a local write: the row callers should see, the operation that
/// will carry it to the server, and the notifications to publish.
#[derive(Debug, Default)]
pub(crate) struct Staged {
    pub entity: Option<CachedEntity>,
    pub op_id: Option<u64>,
    pub events: Vec<SyncEvent>,
}

/// A new row and the create op queued for it.
#[derive(Debug)]
pub(crate) struct Created {
    pub entity: CachedEntity,
    pub op_id: u64,
    pub events: Vec<SyncEvent>,
}

impl From<Created> for Staged {
    fn from(created: Created) -> Self {
        Staged {
            entity: Some(created.entity),
            op_id: Some(created.op_id),
            events: created.events,
        }
    }
}

fn changed(entity: &CachedEntity) -> SyncEvent {
    SyncEvent::EntityChanged {
        collection: entity.collection.clone(),
        id: entity.id.clone(),
        sync_state: entity.sync_state,
    }
}

fn removed(collection: &str, id: &EntityId) -> SyncEvent {
    SyncEvent::EntityRemoved {
        collection: collection.to_string(),
        id: id.clone(),
    }
}

impl Tables {
    // ===== Local writes =====

    pub fn stage_create(&mut self, collection: &str, payload: Value, now: DateTime<Utc>) -> Created {
        let client_id = self.next_client_id();
        let entity = CachedEntity::local_create(collection, &client_id, payload.clone(), now);
        let op_id = self.push_op(PendingOperation::new(
            OpKind::Create,
            collection,
            EntityId::from(&client_id),
            payload,
            None,
            now,
        ));
        let events = vec![changed(&entity)];
        self.insert_entity(entity.clone());

        Created {
            entity,
            op_id,
            events,
        }
    }

    pub fn stage_update(
        &mut self,
        collection: &str,
        id: &EntityId,
        patch: &Value,
        now: DateTime<Utc>,
    ) -> Result<Staged, SyncError> {
        let target = Target::new(collection, id);
        let mut entity = match self.entity(collection, id) {
            Some(e) if e.sync_state == SyncState::Conflict => {
                return Err(SyncError::Conflict(target.to_string()))
            }
            Some(e) if e.deleted => return Err(SyncError::NotFound(target.to_string())),
            Some(e) => e.clone(),
            None => CachedEntity::placeholder(collection, id.clone(), now),
        };
        merge_patch(&mut entity.payload, patch);
        entity.sync_state = SyncState::Pending;
        entity.last_modified_locally = Some(now);

        // An update to a create the server has not seen yet rides along with it
        let unsent_create = self
            .ops_for(&target)
            .filter(|op| op.kind == OpKind::Create && op.is_unsent())
            .map(|op| op.op_id)
            .last();

        let op_id = match unsent_create {
            Some(op_id) => {
                if let Some(create) = self.pending_operations.get_mut(&op_id) {
                    merge_patch(&mut create.payload, patch);
                }
                debug!(op_id, entity = %target, "Folded update into queued create");
                op_id
            }
            None => self.push_op(PendingOperation::new(
                OpKind::Update,
                collection,
                id.clone(),
                patch.clone(),
                entity.server_version,
                now,
            )),
        };

        let events = vec![changed(&entity)];
        self.insert_entity(entity.clone());
        Ok(Staged {
            entity: Some(entity),
            op_id: Some(op_id),
            events,
        })
    }

    pub fn stage_remove(
        &mut self,
        collection: &str,
        id: &EntityId,
        now: DateTime<Utc>,
    ) -> Result<Staged, SyncError> {
        let target = Target::new(collection, id);
        let mut entity = match self.entity(collection, id) {
            Some(e) if e.sync_state == SyncState::Conflict => {
                return Err(SyncError::Conflict(target.to_string()))
            }
            Some(e) if e.deleted => return Err(SyncError::NotFound(target.to_string())),
            Some(e) => e.clone(),
            None => CachedEntity::placeholder(collection, id.clone(), now),
        };

        let unsent: Vec<(u64, OpKind)> = self
            .ops_for(&target)
            .filter(|op| op.is_unsent())
            .map(|op| (op.op_id, op.kind))
            .collect();
        let cancels_create = unsent.iter().any(|(_, kind)| *kind == OpKind::Create);
        for (op_id, _) in &unsent {
            self.pending_operations.remove(op_id);
        }
        if !unsent.is_empty() {
            debug!(entity = %target, cancelled = unsent.len(), "Delete cancelled unsent operations");
        }

        let events = vec![removed(collection, id)];
        if cancels_create {
            // The server never heard of this row
            self.remove_entity(collection, id);
            return Ok(Staged {
                entity: None,
                op_id: None,
                events,
            });
        }

        entity.deleted = true;
        entity.sync_state = SyncState::Pending;
        entity.last_modified_locally = Some(now);
        let op_id = self.push_op(PendingOperation::new(
            OpKind::Delete,
            collection,
            id.clone(),
            Value::Null,
            entity.server_version,
            now,
        ));
        self.insert_entity(entity.clone());

        Ok(Staged {
            entity: Some(entity),
            op_id: Some(op_id),
            events,
        })
    }

    pub fn stage_resolution(
        &mut self,
        collection: &str,
        id: &EntityId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Staged, SyncError> {
        let target = Target::new(collection, id);
        let mut entity = match self.entity(collection, id) {
            Some(e) if e.sync_state == SyncState::Conflict => e.clone(),
            Some(_) => return Err(SyncError::NotInConflict(target.to_string())),
            None => return Err(SyncError::NotFound(target.to_string())),
        };

        match (resolution, entity.held_server.take()) {
            (Resolution::KeepServer, Some(record)) => {
                entity.adopt(&record);
                let events = vec![changed(&entity)];
                self.insert_entity(entity.clone());
                Ok(Staged {
                    entity: Some(entity),
                    op_id: None,
                    events,
                })
            }
            (Resolution::KeepServer, None) => {
                self.remove_entity(collection, id);
                Ok(Staged {
                    events: vec![removed(collection, id)],
                    ..Default::default()
                })
            }
            (Resolution::KeepLocal, Some(record)) => {
                entity.server_version = Some(record.version);
                entity.server_updated_at = Some(record.updated_at);
                entity.sync_state = SyncState::Pending;
                entity.last_modified_locally = Some(now);
                let (kind, payload) = if entity.deleted {
                    (OpKind::Delete, Value::Null)
                } else {
                    (OpKind::Update, merge_diff(&record.data, &entity.payload))
                };
                let op_id = self.push_op(PendingOperation::new(
                    kind,
                    collection,
                    id.clone(),
                    payload,
                    Some(record.version),
                    now,
                ));
                let events = vec![changed(&entity)];
                self.insert_entity(entity.clone());
                Ok(Staged {
                    entity: Some(entity),
                    op_id: Some(op_id),
                    events,
                })
            }
            (Resolution::KeepLocal, None) if entity.deleted => {
                // Both sides deleted it
                self.remove_entity(collection, id);
                Ok(Staged {
                    events: vec![removed(collection, id)],
                    ..Default::default()
                })
            }
            (Resolution::KeepLocal, None) => {
                // Deleted on the server: bring it back as a new record
                self.remove_entity(collection, id);
                let mut staged = Staged::from(self.stage_create(collection, entity.payload, now));
                staged.events.insert(0, removed(collection, id));
                Ok(staged)
            }
        }
    }

    // ===== Server confirmations =====

    /// Settle a transmitted operation. The op and anything it invalidated
    /// leave the queue; the entity follows the server.
    pub fn acknowledge(&mut self, op_id: u64, ack: Ack) -> Vec<SyncEvent> {
        let Some(op) = self.pending_operations.remove(&op_id) else {
            return Vec::new();
        };
        match (op.kind, ack) {
            (OpKind::Create, Ack::Record(record)) => self.settle_create(&op, record),
            (_, Ack::Record(record)) => self.settle_write(&op.target(), record),
            (_, Ack::Deleted) => self.settle_delete(&op.target()),
        }
    }

    fn settle_create(&mut self, op: &PendingOperation, record: RemoteRecord) -> Vec<SyncEvent> {
        let client_id = op.target_id.as_str().to_string();
        let new_target = Target::new(op.collection.clone(), record.id.clone());

        // Later operations were queued against the client id
        for later in self.pending_operations.values_mut() {
            if later.collection == op.collection && later.target_id == op.target_id {
                later.target_id = record.id.clone();
                later.base_version = Some(record.version);
            }
        }

        let Some(mut entity) = self.remove_entity(&op.collection, &op.target_id) else {
            return Vec::new();
        };
        entity.id = record.id.clone();
        entity.client_id = Some(client_id.clone());
        entity.server_version = Some(record.version);
        entity.server_updated_at = Some(record.updated_at);
        if !self.has_ops_for(&new_target) {
            entity.adopt(&record);
        }

        let mut events = Vec::new();
        if record.id.as_str() != client_id {
            events.push(SyncEvent::IdReassigned {
                collection: op.collection.clone(),
                client_id,
                id: record.id.clone(),
            });
        }
        events.push(changed(&entity));
        self.insert_entity(entity);
        events
    }

    fn settle_write(&mut self, target: &Target, record: RemoteRecord) -> Vec<SyncEvent> {
        self.rebase(target, record.version);
        let still_pending = self.has_ops_for(target);

        let Some(entity) = self.entity_mut(&target.collection, &target.id) else {
            return Vec::new();
        };
        entity.server_version = Some(record.version);
        entity.server_updated_at = Some(record.updated_at);
        if !still_pending && entity.sync_state == SyncState::Pending {
            entity.adopt(&record);
        }
        vec![changed(entity)]
    }

    fn settle_delete(&mut self, target: &Target) -> Vec<SyncEvent> {
        for op_id in self.op_ids_for(target) {
            self.pending_operations.remove(&op_id);
        }
        match self.remove_entity(&target.collection, &target.id) {
            Some(_) => vec![removed(&target.collection, &target.id)],
            None => Vec::new(),
        }
    }

    /// Later operations on `target` now build on `version`.
    fn rebase(&mut self, target: &Target, version: u64) {
        for op in self.pending_operations.values_mut() {
            if op.collection == target.collection && op.target_id == target.id {
                op.base_version = Some(version);
            }
        }
    }

    /// The server side won. Every queued op for the target is dropped and the
    /// row waits in CONFLICT with the server record held (`None` when the
    /// server no longer has it).
    pub fn mark_conflict(&mut self, op_id: u64, server: Option<RemoteRecord>) -> Vec<SyncEvent> {
        let Some(op) = self.pending_operations.get(&op_id).cloned() else {
            return Vec::new();
        };
        let target = op.target();
        for queued in self.op_ids_for(&target) {
            self.pending_operations.remove(&queued);
        }

        if self.entity(&op.collection, &op.target_id).is_none() {
            let mut placeholder =
                CachedEntity::placeholder(op.collection.clone(), op.target_id.clone(), op.created_at);
            placeholder.deleted = op.kind == OpKind::Delete;
            self.insert_entity(placeholder);
        }
        let Some(entity) = self.entity_mut(&op.collection, &op.target_id) else {
            return Vec::new();
        };
        entity.sync_state = SyncState::Conflict;
        entity.held_server = server;

        vec![
            SyncEvent::ConflictDetected {
                collection: op.collection.clone(),
                id: op.target_id.clone(),
                op_id,
                kind: op.kind,
            },
            changed(entity),
        ]
    }

    // ===== Server reads =====

    /// Mirror a record the server returned. CLEAN rows are overwritten;
    /// PENDING and CONFLICT rows only hold it for later resolution.
    pub fn apply_remote(&mut self, collection: &str, record: &RemoteRecord) -> Option<SyncEvent> {
        if let Some(client_id) = record.client_id.as_deref() {
            if self.local_row(collection, client_id).is_some() {
                // The queued create reconciles this one
                return None;
            }
        }

        match self.entity_mut(collection, &record.id) {
            Some(entity) if entity.sync_state == SyncState::Clean => {
                if entity.server_version == Some(record.version) && entity.payload == record.data {
                    return None;
                }
                entity.adopt(record);
                Some(changed(entity))
            }
            Some(entity) => {
                if entity.held_server.as_ref() != Some(record) {
                    debug!(collection, id = %record.id, "Holding server record for pending row");
                    entity.held_server = Some(record.clone());
                }
                None
            }
            None => {
                let entity = CachedEntity::from_remote(collection, record);
                let event = changed(&entity);
                self.insert_entity(entity);
                Some(event)
            }
        }
    }

    /// The server no longer has the record. Only CLEAN rows follow it.
    pub fn drop_missing(&mut self, collection: &str, id: &EntityId) -> Option<SyncEvent> {
        match self.entity(collection, id) {
            Some(entity) if entity.sync_state == SyncState::Clean => {
                self.remove_entity(collection, id);
                Some(removed(collection, id))
            }
            _ => None,
        }
    }

    // ===== Attempt bookkeeping =====

    /// Flag the op as possibly seen by the server and return what to send.
    pub fn begin_attempt(&mut self, op_id: u64) -> Option<PendingOperation> {
        let op = self.pending_operations.get_mut(&op_id)?;
        if op.status != OpStatus::Queued {
            return None;
        }
        op.transmitted = true;
        Some(op.clone())
    }

    pub fn set_base_version(&mut self, op_id: u64, version: u64) {
        if let Some(op) = self.pending_operations.get_mut(&op_id) {
            op.base_version = Some(version);
        }
    }

    pub fn defer(&mut self, op_id: u64, attempts: u32, error: String, next_attempt_at: DateTime<Utc>) {
        if let Some(op) = self.pending_operations.get_mut(&op_id) {
            op.attempts = attempts;
            op.last_error = Some(error);
            op.next_attempt_at = Some(next_attempt_at);
        }
    }

    pub fn mark_failed(&mut self, op_id: u64, attempts: u32, error: String) -> Option<SyncEvent> {
        let op = self.pending_operations.get_mut(&op_id)?;
        op.attempts = attempts;
        op.status = OpStatus::Failed;
        op.next_attempt_at = None;
        op.last_error = Some(error.clone());
        Some(SyncEvent::OperationFailed {
            op_id,
            collection: op.collection.clone(),
            target_id: op.target_id.clone(),
            attempts,
            error,
        })
    }

    // ===== User actions on failed operations =====

    pub fn requeue_failed(&mut self, op_id: u64) -> Result<(), SyncError> {
        match self.pending_operations.get_mut(&op_id) {
            Some(op) if op.is_failed() => {
                op.status = OpStatus::Queued;
                op.attempts = 0;
                op.next_attempt_at = None;
                op.last_error = None;
                Ok(())
            }
            _ => Err(SyncError::UnknownOperation(op_id)),
        }
    }

    /// Drop a failed op together with everything queued after it for the same
    /// target, and roll the row back to server state.
    pub fn discard_failed(&mut self, op_id: u64) -> Result<Vec<SyncEvent>, SyncError> {
        let op = match self.pending_operations.get(&op_id) {
            Some(op) if op.is_failed() => op.clone(),
            _ => return Err(SyncError::UnknownOperation(op_id)),
        };
        let target = op.target();
        for queued in self.op_ids_for(&target) {
            self.pending_operations.remove(&queued);
        }

        if op.kind == OpKind::Create {
            return Ok(match self.remove_entity(&target.collection, &target.id) {
                Some(_) => vec![removed(&target.collection, &target.id)],
                None => Vec::new(),
            });
        }

        let Some(entity) = self.entity_mut(&target.collection, &target.id) else {
            return Ok(Vec::new());
        };
        match entity.held_server.take() {
            Some(record) => entity.adopt(&record),
            None => {
                // Unknown server state; the next refresh overwrites the row
                entity.sync_state = SyncState::Clean;
                entity.deleted = false;
                entity.server_version = None;
            }
        }
        Ok(vec![changed(entity)])
    }
}
