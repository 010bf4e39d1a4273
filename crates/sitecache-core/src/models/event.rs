use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::{EntityId, OpKind, SyncSession, SyncState};

/// Change notifications for front ends, so they can refresh without polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    EntityChanged {
        collection: String,
        id: EntityId,
        sync_state: SyncState,
    },
    #[serde(rename_all = "camelCase")]
    EntityRemoved { collection: String, id: EntityId },
    /// A create was acknowledged and the row is now keyed by the server id.
    #[serde(rename_all = "camelCase")]
    IdReassigned {
        collection: String,
        client_id: String,
        id: EntityId,
    },
    #[serde(rename_all = "camelCase")]
    ConflictDetected {
        collection: String,
        id: EntityId,
        op_id: u64,
        kind: OpKind,
    },
    /// The operation needs the user to retry or discard it.
    #[serde(rename_all = "camelCase")]
    OperationFailed {
        op_id: u64,
        collection: String,
        target_id: EntityId,
        attempts: u32,
        error: String,
    },
    SessionCompleted(SyncSession),
}
