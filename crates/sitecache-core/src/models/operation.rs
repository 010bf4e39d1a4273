use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::{EntityId, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum OpStatus {
    #[default]
    Queued,
    /// Retries exhausted or rejected by the server. Waits for the user to retry or discard.
    Failed,
}

/// A mutation waiting to be acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct PendingOperation {
    /// Assigned by the store on enqueue; defines replay order.
    pub op_id: u64,
    pub kind: OpKind,
    pub collection: String,
    /// Client id for a create, server id otherwise.
    pub target_id: EntityId,
    /// Full body for a create, merge patch for an update, null for a delete.
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Server version of the target when the edit was made.
    #[serde(default)]
    pub base_version: Option<u64>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: OpStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set once a transmission was started. The server may have seen it from then on.
    #[serde(default)]
    pub transmitted: bool,
}

impl PendingOperation {
    pub fn new(
        kind: OpKind,
        collection: impl Into<String>,
        target_id: EntityId,
        payload: Value,
        base_version: Option<u64>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            op_id: 0,
            kind,
            collection: collection.into(),
            target_id,
            payload,
            attempts: 0,
            created_at,
            base_version,
            next_attempt_at: None,
            status: OpStatus::Queued,
            last_error: None,
            transmitted: false,
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.collection.clone(), self.target_id.clone())
    }

    pub fn is_failed(&self) -> bool {
        self.status == OpStatus::Failed
    }

    /// Queued, never transmitted, and therefore safe to cancel or fold.
    pub fn is_unsent(&self) -> bool {
        self.status == OpStatus::Queued && !self.transmitted
    }

    /// Eligible for transmission at `now` (not failed, backoff expired).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OpStatus::Queued && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
