use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

use crate::models::{CachedEntity, EntityId, PendingOperation, Target};

/// Small bookkeeping record persisted next to the tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct StoreMetadata {
    /// Completion time of the latest sync session
    pub last_sync_session_at: Option<DateTime<Utc>>,
    /// Next op id to hand out. Op ids are never reused.
    pub next_op_id: u64,
    /// Next sequence number for `tmp-N` client ids
    pub next_client_seq: u64,
    /// Random per-install id, scopes idempotency keys on the server
    pub device_id: String,
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self {
            last_sync_session_at: None,
            next_op_id: 1,
            next_client_seq: 1,
            device_id: String::new(),
        }
    }
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Tables {
    #[serde(default)]
    pub entities: BTreeMap<String, BTreeMap<EntityId, CachedEntity>>,
    #[serde(default)]
    pub pending_operations: BTreeMap<u64, PendingOperation>,
    #[serde(default)]
    pub metadata: StoreMetadata,
}

impl Tables {
    pub fn entity(&self, collection: &str, id: &EntityId) -> Option<&CachedEntity> {
        self.entities.get(collection)?.get(id)
    }

    pub fn entity_mut(&mut self, collection: &str, id: &EntityId) -> Option<&mut CachedEntity> {
        self.entities.get_mut(collection)?.get_mut(id)
    }

    pub fn insert_entity(&mut self, entity: CachedEntity) -> Option<CachedEntity> {
        self.entities
            .entry(entity.collection.clone())
            .or_default()
            .insert(entity.id.clone(), entity)
    }

    pub fn remove_entity(&mut self, collection: &str, id: &EntityId) -> Option<CachedEntity> {
        let rows = self.entities.get_mut(collection)?;
        let removed = rows.remove(id);
        if rows.is_empty() {
            self.entities.remove(collection);
        }
        removed
    }

    /// Row created locally under `client_id` that the server has not acknowledged.
    pub fn local_row(&self, collection: &str, client_id: &str) -> Option<&CachedEntity> {
        self.entity(collection, &EntityId::from(client_id))
            .filter(|e| e.is_local_only())
    }

    pub fn find_by_client_id(&self, collection: &str, client_id: &str) -> Option<&CachedEntity> {
        self.entities
            .get(collection)?
            .values()
            .find(|e| e.client_id.as_deref() == Some(client_id))
    }

    /// Append to the queue, assigning the next op id.
    pub fn push_op(&mut self, mut op: PendingOperation) -> u64 {
        let op_id = self.metadata.next_op_id;
        self.metadata.next_op_id += 1;
        op.op_id = op_id;
        self.pending_operations.insert(op_id, op);
        op_id
    }

    pub fn ops_for<'a>(
        &'a self,
        target: &'a Target,
    ) -> impl Iterator<Item = &'a PendingOperation> + 'a {
        self.pending_operations
            .values()
            .filter(move |op| op.collection == target.collection && op.target_id == target.id)
    }

    pub fn op_ids_for(&self, target: &Target) -> Vec<u64> {
        self.ops_for(target).map(|op| op.op_id).collect()
    }

    pub fn has_ops_for(&self, target: &Target) -> bool {
        self.ops_for(target).next().is_some()
    }

    /// No earlier op is queued for the same target.
    pub fn is_head(&self, op_id: u64) -> bool {
        let Some(op) = self.pending_operations.get(&op_id) else {
            return false;
        };
        let target = op.target();
        let head = self.ops_for(&target).next().map(|head| head.op_id);
        head == Some(op_id)
    }

    pub fn next_client_id(&mut self) -> String {
        let seq = self.metadata.next_client_seq;
        self.metadata.next_client_seq += 1;
        format!("tmp-{}", seq)
    }
}
