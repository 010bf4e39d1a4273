use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::{RemoteApi, RemoteError};
use crate::clock::{Clock, SystemClock};
use crate::models::{EntityId, ListFilter, RemoteRecord};
use crate::utils::merge_patch;

/// Failure injected into the next write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer 500 without applying the write
    ServerError,
    /// Fail as if the host could not be reached
    Unreachable,
    /// Never answer
    Hang,
    /// Apply the write, then lose the answer
    DropResponse,
    /// Report a conflict while the version still matches (replication lag)
    StaleConflict,
    /// Report a conflict with an empty body
    BareConflict,
    /// Apply the write, answering a second late
    Slow,
}

const SLOW_RESPONSE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct ServerState {
    collections: BTreeMap<String, BTreeMap<EntityId, RemoteRecord>>,
    client_ids: HashMap<(String, String), EntityId>,
    next_id: u64,
    unreachable: bool,
    faults: VecDeque<Fault>,
    persistent_fault: Option<Fault>,
    applied_writes: usize,
    write_requests: usize,
}

impl ServerState {
    fn record(&self, collection: &str, id: &EntityId) -> Option<&RemoteRecord> {
        self.collections.get(collection)?.get(id)
    }

    fn next_fault(&mut self) -> Option<Fault> {
        self.faults.pop_front().or(self.persistent_fault)
    }
}

/// In-process server with the same contract as the HTTP API: versioned
/// records, client-id deduplication of creates, version preconditions.
pub struct InMemoryRemote {
    state: Mutex<ServerState>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// How a write request ends once faults were considered.
enum Plan {
    Apply,
    ApplyAndDrop,
    Fail(RemoteError),
    StaleConflict,
    Slow,
    Hang,
}

impl InMemoryRemote {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(ServerState {
                next_id: 1,
                ..Default::default()
            }),
            clock,
        }
    }

    /// Server ids for new records start at `next_id`.
    pub fn with_next_id(self, next_id: u64) -> Self {
        self.lock().next_id = next_id;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ===== Test controls =====

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Queue a one-shot fault for the next write request.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Fail every write request with `fault` until cleared with `None`.
    pub fn fail_always(&self, fault: Option<Fault>) {
        self.lock().persistent_fault = fault;
    }

    /// Writes that changed server state.
    pub fn write_count(&self) -> usize {
        self.lock().applied_writes
    }

    /// Write requests received, including rejected ones.
    pub fn request_count(&self) -> usize {
        self.lock().write_requests
    }

    /// Insert a record as if another client created it.
    pub fn seed(&self, collection: &str, id: impl Into<EntityId>, data: Value) -> RemoteRecord {
        let record = RemoteRecord {
            id: id.into(),
            version: 1,
            updated_at: self.clock.now(),
            client_id: None,
            data,
        };
        self.lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record.clone());
        record
    }

    /// Change a record as another client would, bumping its version.
    pub fn server_edit(&self, collection: &str, id: impl Into<EntityId>, patch: &Value) -> Option<RemoteRecord> {
        let now = self.clock.now();
        let mut state = self.lock();
        let record = state.collections.get_mut(collection)?.get_mut(&id.into())?;
        merge_patch(&mut record.data, patch);
        record.version += 1;
        record.updated_at = now;
        Some(record.clone())
    }

    /// Delete a record as another client would.
    pub fn server_delete(&self, collection: &str, id: impl Into<EntityId>) -> Option<RemoteRecord> {
        self.lock().collections.get_mut(collection)?.remove(&id.into())
    }

    pub fn record(&self, collection: &str, id: impl Into<EntityId>) -> Option<RemoteRecord> {
        self.lock().record(collection, &id.into()).cloned()
    }

    pub fn records(&self, collection: &str) -> Vec<RemoteRecord> {
        self.lock()
            .collections
            .get(collection)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    // ===== Request handling =====

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.lock().unreachable {
            Err(RemoteError::Unreachable)
        } else {
            Ok(())
        }
    }

    fn plan_write(&self) -> Plan {
        let mut state = self.lock();
        state.write_requests += 1;
        if state.unreachable {
            return Plan::Fail(RemoteError::Unreachable);
        }
        match state.next_fault() {
            None => Plan::Apply,
            Some(Fault::DropResponse) => Plan::ApplyAndDrop,
            Some(Fault::ServerError) => {
                Plan::Fail(RemoteError::ServerError("injected failure".to_string()))
            }
            Some(Fault::Unreachable) => Plan::Fail(RemoteError::Unreachable),
            Some(Fault::StaleConflict) => Plan::StaleConflict,
            Some(Fault::BareConflict) => Plan::Fail(RemoteError::Conflict { current: None }),
            Some(Fault::Slow) => Plan::Slow,
            Some(Fault::Hang) => Plan::Hang,
        }
    }

    /// Run a write according to the plan drawn for it.
    async fn write<T>(
        &self,
        apply: impl FnOnce(&mut ServerState) -> Result<T, RemoteError>,
        stale: impl FnOnce(&ServerState) -> Option<RemoteRecord>,
    ) -> Result<T, RemoteError> {
        match self.plan_write() {
            Plan::Fail(e) => Err(e),
            Plan::Hang => std::future::pending().await,
            Plan::StaleConflict => Err(RemoteError::Conflict {
                current: stale(&self.lock()).map(Box::new),
            }),
            Plan::Slow => {
                tokio::time::sleep(SLOW_RESPONSE).await;
                let mut state = self.lock();
                let out = apply(&mut state)?;
                state.applied_writes += 1;
                Ok(out)
            }
            Plan::Apply => {
                let mut state = self.lock();
                let out = apply(&mut state)?;
                state.applied_writes += 1;
                Ok(out)
            }
            Plan::ApplyAndDrop => {
                let mut state = self.lock();
                apply(&mut state)?;
                state.applied_writes += 1;
                debug!("Dropping response of an applied write");
                Err(RemoteError::Unreachable)
            }
        }
    }
}

impl RemoteApi for InMemoryRemote {
    async fn fetch(&self, collection: &str, id: &EntityId) -> Result<RemoteRecord, RemoteError> {
        self.check_reachable()?;
        self.lock()
            .record(collection, id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", collection, id)))
    }

    async fn list(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.check_reachable()?;
        Ok(self
            .records(collection)
            .into_iter()
            .filter(|r| filter.matches(&r.data))
            .collect())
    }

    async fn create(
        &self,
        collection: &str,
        client_id: &str,
        data: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        let now = self.clock.now();
        let key = (collection.to_string(), client_id.to_string());
        self.write(
            |state| {
                if let Some(id) = state.client_ids.get(&key) {
                    return match state.record(collection, id) {
                        Some(existing) => Err(RemoteError::AlreadyExists(Box::new(existing.clone()))),
                        None => Err(RemoteError::Conflict { current: None }),
                    };
                }
                let id = EntityId::from(state.next_id);
                state.next_id += 1;
                let record = RemoteRecord {
                    id: id.clone(),
                    version: 1,
                    updated_at: now,
                    client_id: Some(client_id.to_string()),
                    data: data.clone(),
                };
                state.client_ids.insert(key.clone(), id.clone());
                state
                    .collections
                    .entry(collection.to_string())
                    .or_default()
                    .insert(id, record.clone());
                Ok(record)
            },
            |_| None,
        )
        .await
    }

    async fn update(
        &self,
        collection: &str,
        id: &EntityId,
        patch: &Value,
        expected_version: Option<u64>,
    ) -> Result<RemoteRecord, RemoteError> {
        let now = self.clock.now();
        self.write(
            |state| {
                let record = state
                    .collections
                    .get_mut(collection)
                    .and_then(|rows| rows.get_mut(id))
                    .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", collection, id)))?;
                if expected_version.is_some_and(|v| v != record.version) {
                    return Err(RemoteError::Conflict {
                        current: Some(Box::new(record.clone())),
                    });
                }
                merge_patch(&mut record.data, patch);
                record.version += 1;
                record.updated_at = now;
                Ok(record.clone())
            },
            |state| state.record(collection, id).cloned(),
        )
        .await
    }

    async fn delete(
        &self,
        collection: &str,
        id: &EntityId,
        expected_version: Option<u64>,
    ) -> Result<(), RemoteError> {
        self.write(
            |state| {
                let rows = state
                    .collections
                    .get_mut(collection)
                    .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", collection, id)))?;
                let record = rows
                    .get(id)
                    .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", collection, id)))?;
                if expected_version.is_some_and(|v| v != record.version) {
                    return Err(RemoteError::Conflict {
                        current: Some(Box::new(record.clone())),
                    });
                }
                rows.remove(id);
                Ok(())
            },
            |state| state.record(collection, id).cloned(),
        )
        .await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_is_deduplicated_by_client_id() {
        let remote = InMemoryRemote::default().with_next_id(907);
        let first = remote.create("cubeTests", "tmp-1", &json!({"grade": 40})).await.unwrap();
        assert_eq!(first.id.as_str(), "907");

        match remote.create("cubeTests", "tmp-1", &json!({"grade": 40})).await {
            Err(RemoteError::AlreadyExists(existing)) => assert_eq!(existing.id, first.id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(remote.records("cubeTests").len(), 1);
        assert_eq!(remote.write_count(), 1);
        assert_eq!(remote.request_count(), 2);
    }

    #[tokio::test]
    async fn test_update_checks_expected_version() {
        let remote = InMemoryRemote::default();
        remote.seed("batches", 42_i64, json!({"status": "poured"}));
        let id = EntityId::from(42_i64);

        let updated = remote
            .update("batches", &id, &json!({"status": "approved"}), Some(1))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        match remote.update("batches", &id, &json!({"status": "x"}), Some(1)).await {
            Err(RemoteError::Conflict { current: Some(current) }) => assert_eq!(current.version, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_response_still_applies() {
        let remote = InMemoryRemote::default();
        remote.seed("batches", 42_i64, json!({}));
        remote.inject(Fault::DropResponse);

        let result = remote.delete("batches", &EntityId::from(42_i64), None).await;
        assert!(matches!(result, Err(RemoteError::Unreachable)));
        assert!(remote.record("batches", 42_i64).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_rejects_everything() {
        let remote = InMemoryRemote::default();
        remote.set_reachable(false);
        assert!(remote.ping().await.is_err());
        assert!(matches!(
            remote.fetch("batches", &EntityId::from("1")).await,
            Err(RemoteError::Unreachable)
        ));
    }
}
