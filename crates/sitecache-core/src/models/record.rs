use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::EntityId;

/// Envelope the server wraps every record in.
///
/// ```json
/// {"id": 907, "version": 5, "updatedAt": "2026-03-01T10:00:00Z", "clientId": "tmp-1", "data": {...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct RemoteRecord {
    pub id: EntityId,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}
