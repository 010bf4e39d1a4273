use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::RemoteRecord;

/// Identifier of a record within its collection.
///
/// Servers hand out both numeric and string ids, so the id is normalized to its
/// string form: `42` and `"42"` address the same row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&String> for EntityId {
    fn from(id: &String) -> Self {
        Self(id.clone())
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<i32> for EntityId {
    fn from(id: i32) -> Self {
        Self(id.to_string())
    }
}

impl From<&EntityId> for EntityId {
    fn from(id: &EntityId) -> Self {
        id.clone()
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => Self(s),
            RawId::Unsigned(n) => Self(n.to_string()),
            RawId::Signed(n) => Self(n.to_string()),
        })
    }
}

/// A `(collection, id)` pair. Queue ordering and in-flight tracking are per target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub collection: String,
    pub id: EntityId,
}

impl Target {
    pub fn new(collection: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum SyncState {
    /// Payload matches the last known server state
    Clean,
    /// Local edits have not reached the server yet
    Pending,
    /// A sync attempt found a server-side change colliding with a local edit
    Conflict,
}

/// Local mirror of one server resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct CachedEntity {
    pub collection: String,
    pub id: EntityId,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub server_version: Option<u64>,
    #[serde(default)]
    pub server_updated_at: Option<DateTime<Utc>>,
    pub sync_state: SyncState,
    #[serde(default)]
    pub last_modified_locally: Option<DateTime<Utc>>,
    /// Removed locally, waiting for the server to acknowledge the delete.
    #[serde(default)]
    pub deleted: bool,
    /// Server state that arrived while local edits were outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_server: Option<RemoteRecord>,
}

impl CachedEntity {
    /// A clean row mirroring what the server returned.
    pub fn from_remote(collection: impl Into<String>, record: &RemoteRecord) -> Self {
        Self {
            collection: collection.into(),
            id: record.id.clone(),
            client_id: record.client_id.clone(),
            payload: record.data.clone(),
            server_version: Some(record.version),
            server_updated_at: Some(record.updated_at),
            sync_state: SyncState::Clean,
            last_modified_locally: None,
            deleted: false,
            held_server: None,
        }
    }

    /// An optimistic row for a create the server has not confirmed yet.
    /// It is keyed by its client id until the server assigns the real one.
    pub fn local_create(
        collection: impl Into<String>,
        client_id: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: EntityId::from(client_id),
            client_id: Some(client_id.to_string()),
            payload,
            server_version: None,
            server_updated_at: None,
            sync_state: SyncState::Pending,
            last_modified_locally: Some(now),
            deleted: false,
            held_server: None,
        }
    }

    /// A pending row for an edit to a record that was never cached.
    pub fn placeholder(collection: impl Into<String>, id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            collection: collection.into(),
            id,
            client_id: None,
            payload: Value::Object(Default::default()),
            server_version: None,
            server_updated_at: None,
            sync_state: SyncState::Pending,
            last_modified_locally: Some(now),
            deleted: false,
            held_server: None,
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.collection.clone(), self.id.clone())
    }

    /// True while the row is still keyed by its client id, i.e. the server has
    /// not acknowledged the create.
    pub fn is_local_only(&self) -> bool {
        self.client_id.as_deref() == Some(self.id.as_str())
    }

    /// Whether callers should see this row. Conflicted tombstones stay visible
    /// so they can be resolved.
    pub fn is_visible(&self) -> bool {
        !self.deleted || self.sync_state == SyncState::Conflict
    }

    /// Take the server record as the new truth and drop local state.
    pub fn adopt(&mut self, record: &RemoteRecord) {
        self.id = record.id.clone();
        self.payload = record.data.clone();
        self.server_version = Some(record.version);
        self.server_updated_at = Some(record.updated_at);
        self.sync_state = SyncState::Clean;
        self.deleted = false;
        self.held_server = None;
        if record.client_id.is_some() {
            self.client_id = record.client_id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, version: u64) -> RemoteRecord {
        RemoteRecord {
            id: EntityId::from(id),
            version,
            updated_at: Utc::now(),
            client_id: None,
            data: json!({"status": "poured"}),
        }
    }

    #[test]
    fn test_entity_id_accepts_numbers_and_strings() {
        let a: EntityId = serde_json::from_value(json!(42)).unwrap();
        let b: EntityId = serde_json::from_value(json!("42")).unwrap();
        assert_eq!(a, b);
        assert_eq!(EntityId::from(42_i64), a);
        assert_eq!(serde_json::to_value(&a).unwrap(), json!("42"));
    }

    #[test]
    fn test_local_create_is_keyed_by_client_id() {
        let entity = CachedEntity::local_create("cubeTests", "tmp-1", json!({}), Utc::now());
        assert!(entity.is_local_only());
        assert_eq!(entity.id.as_str(), "tmp-1");
        assert_eq!(entity.sync_state, SyncState::Pending);
        assert_eq!(entity.server_version, None);
    }

    #[test]
    fn test_adopt_rekeys_and_cleans() {
        let mut entity = CachedEntity::local_create("cubeTests", "tmp-1", json!({}), Utc::now());
        entity.deleted = true;
        entity.adopt(&record("907", 1));
        assert_eq!(entity.id.as_str(), "907");
        assert_eq!(entity.client_id.as_deref(), Some("tmp-1"));
        assert!(!entity.is_local_only());
        assert_eq!(entity.sync_state, SyncState::Clean);
        assert!(!entity.deleted);
    }

    #[test]
    fn test_conflicted_tombstone_stays_visible() {
        let mut entity = CachedEntity::from_remote("batches", &record("42", 3));
        entity.deleted = true;
        entity.sync_state = SyncState::Pending;
        assert!(!entity.is_visible());
        entity.sync_state = SyncState::Conflict;
        assert!(entity.is_visible());
    }
}
