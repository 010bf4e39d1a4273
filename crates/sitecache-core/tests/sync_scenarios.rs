//! End-to-end sync scenarios against the in-process server.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use sitecache_core::{
    CachedEntity, Clock, EntityId, Fault, FileBackend, InMemoryRemote, ListFilter, LocalStore,
    ManualClock, MemoryBackend, OpKind, Resolution, ServerWins, SessionOutcome, SyncConfig,
    SyncEngine, SyncError, SyncEvent, SyncPhase, SyncState,
};
use tokio::sync::broadcast;

struct Harness {
    engine: SyncEngine<InMemoryRemote>,
    remote: Arc<InMemoryRemote>,
    clock: Arc<ManualClock>,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

fn test_config() -> SyncConfig {
    SyncConfig {
        backoff_base_ms: 1_000,
        backoff_cap_ms: 60_000,
        backoff_jitter: 0.0,
        ..SyncConfig::default()
    }
}

fn harness_with(config: SyncConfig, next_id: u64) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let remote = Arc::new(InMemoryRemote::new(clock.clone()).with_next_id(next_id));
    let store = LocalStore::open(MemoryBackend::new()).unwrap();
    let engine = SyncEngine::builder(store, Arc::clone(&remote))
        .config(config)
        .clock(clock.clone())
        .build();
    Harness {
        engine,
        remote,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), 1)
}

impl Harness {
    fn online(&self) {
        self.engine.probe().set_link_up(true);
        self.engine.probe().record_reachability(true);
    }

    fn offline(&self) {
        self.engine.probe().set_link_up(false);
    }

    /// Cache `batches/42` at version 1.
    async fn cached_batch(&self) {
        self.remote
            .seed("batches", "42", json!({"status": "poured", "site": "north"}));
        self.online();
        self.engine.gateway().read("batches", "42").await.unwrap();
    }

    async fn entity(&self, id: &str) -> Option<CachedEntity> {
        self.engine.store().get("batches", &EntityId::from(id)).await
    }
}

fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ===== Queue replay =====

#[tokio::test]
async fn offline_create_is_reassigned_the_server_id() {
    let h = harness_with(test_config(), 907);
    let mut events = h.engine.subscribe();

    let created = h
        .engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();
    assert_eq!(created.id.as_str(), "tmp-1");

    h.online();
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(session.drained_count, 1);

    let synced = h.entity("907").await.unwrap();
    assert_eq!(synced.client_id.as_deref(), Some("tmp-1"));
    assert_eq!(synced.sync_state, SyncState::Clean);
    assert_eq!(synced.server_version, Some(1));
    assert!(h.entity("tmp-1").await.is_none());

    let events = drain_events(&mut events);
    assert!(events.contains(&SyncEvent::IdReassigned {
        collection: "batches".to_string(),
        client_id: "tmp-1".to_string(),
        id: EntityId::from("907"),
    }));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::SessionCompleted(_))));
}

#[tokio::test]
async fn create_then_update_reaches_the_server_as_one_write() {
    let h = harness();
    h.engine
        .gateway()
        .create("batches", json!({"status": "poured", "site": "north"}))
        .await
        .unwrap();
    h.engine
        .gateway()
        .update("batches", "tmp-1", json!({"status": "cured"}))
        .await
        .unwrap();
    assert_eq!(h.engine.gateway().pending_count().await, 1);

    h.online();
    h.engine.manager().sync_now().await.unwrap();

    assert_eq!(h.remote.write_count(), 1);
    let records = h.remote.records("batches");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, json!({"status": "cured", "site": "north"}));
}

#[tokio::test]
async fn delete_of_unsent_create_sends_nothing() {
    let h = harness();
    h.engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();
    h.engine.gateway().remove("batches", "tmp-1").await.unwrap();
    assert_eq!(h.engine.gateway().pending_count().await, 0);
    assert!(h.entity("tmp-1").await.is_none());

    h.online();
    h.engine.manager().sync_now().await.unwrap();
    assert_eq!(h.remote.request_count(), 0);
    assert!(h.remote.records("batches").is_empty());
}

#[tokio::test]
async fn lost_create_response_does_not_duplicate_the_record() {
    let h = harness();
    h.online();
    h.remote.inject(Fault::DropResponse);

    let created = h
        .engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();
    // Applied on the server, but the answer never arrived
    assert_eq!(created.id.as_str(), "tmp-1");
    assert_eq!(created.sync_state, SyncState::Pending);
    assert_eq!(h.remote.records("batches").len(), 1);

    h.clock.advance(Duration::seconds(2));
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.drained_count, 1);

    assert_eq!(h.remote.records("batches").len(), 1);
    assert_eq!(h.remote.write_count(), 1);
    assert_eq!(h.engine.gateway().pending_count().await, 0);
    let synced = h.entity("1").await.unwrap();
    assert_eq!(synced.sync_state, SyncState::Clean);
}

#[tokio::test]
async fn stale_conflict_is_retried_once() {
    let h = harness();
    h.cached_batch().await;
    h.offline();
    h.engine
        .gateway()
        .update("batches", "42", json!({"status": "approved"}))
        .await
        .unwrap();

    h.online();
    h.remote.inject(Fault::StaleConflict);
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.drained_count, 1);
    assert_eq!(session.conflict_count, 0);

    let record = h.remote.record("batches", "42").unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.data["status"], "approved");
}

#[tokio::test]
async fn delete_of_record_already_gone_settles_quietly() {
    let h = harness();
    h.cached_batch().await;
    h.offline();
    h.engine.gateway().remove("batches", "42").await.unwrap();
    h.remote.server_delete("batches", "42");

    h.online();
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(session.conflict_count, 0);
    assert!(h.entity("42").await.is_none());
    assert_eq!(h.engine.gateway().pending_count().await, 0);
}

// ===== Conflicts =====

#[tokio::test]
async fn newer_server_edit_wins_and_leaves_conflict() {
    let h = harness();
    h.cached_batch().await;
    h.offline();

    h.clock.advance(Duration::minutes(1));
    h.engine
        .gateway()
        .update("batches", "42", json!({"status": "approved"}))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(1));
    h.remote
        .server_edit("batches", "42", &json!({"status": "rejected"}));

    h.online();
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.conflict_count, 1);
    assert_eq!(h.engine.gateway().pending_count().await, 0);

    let entity = h.entity("42").await.unwrap();
    assert_eq!(entity.sync_state, SyncState::Conflict);
    assert_eq!(entity.payload["status"], "approved");
    assert_eq!(entity.held_server.as_ref().map(|r| r.version), Some(2));

    // Edits wait for a resolution
    let err = h
        .engine
        .gateway()
        .update("batches", "42", json!({"status": "cured"}))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict(_)));

    let resolved = h
        .engine
        .gateway()
        .resolve_conflict("batches", "42", Resolution::KeepServer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.sync_state, SyncState::Clean);
    assert_eq!(resolved.payload["status"], "rejected");
    assert!(h.engine.gateway().conflicts().await.is_empty());
}

#[tokio::test]
async fn newer_local_edit_overwrites_server() {
    let h = harness();
    h.cached_batch().await;
    h.offline();

    h.clock.advance(Duration::minutes(1));
    h.remote
        .server_edit("batches", "42", &json!({"site": "south"}));
    h.remote
        .server_edit("batches", "42", &json!({"status": "rejected"}));
    h.clock.advance(Duration::minutes(1));
    h.engine
        .gateway()
        .update("batches", "42", json!({"status": "approved"}))
        .await
        .unwrap();

    h.online();
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.drained_count, 1);
    assert_eq!(session.conflict_count, 0);

    let record = h.remote.record("batches", "42").unwrap();
    assert_eq!(record.version, 4);
    assert_eq!(record.data, json!({"status": "approved", "site": "south"}));

    let entity = h.entity("42").await.unwrap();
    assert_eq!(entity.sync_state, SyncState::Clean);
    assert_eq!(entity.server_version, Some(4));
    assert_eq!(entity.payload, record.data);
}

#[tokio::test]
async fn keep_local_resolution_pushes_the_local_edit() {
    let h = harness();
    h.cached_batch().await;
    h.offline();
    h.engine
        .gateway()
        .update("batches", "42", json!({"status": "approved"}))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(1));
    h.remote
        .server_edit("batches", "42", &json!({"status": "rejected"}));

    h.online();
    h.engine.manager().sync_now().await.unwrap();
    assert_eq!(h.engine.gateway().conflicts().await.len(), 1);

    let resolved = h
        .engine
        .gateway()
        .resolve_conflict("batches", "42", Resolution::KeepLocal)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.sync_state, SyncState::Clean);
    assert_eq!(resolved.server_version, Some(3));

    let record = h.remote.record("batches", "42").unwrap();
    assert_eq!(record.data["status"], "approved");
}

#[tokio::test]
async fn resolving_a_clean_entity_is_rejected() {
    let h = harness();
    h.cached_batch().await;
    let err = h
        .engine
        .gateway()
        .resolve_conflict("batches", "42", Resolution::KeepLocal)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotInConflict(_)));
}

#[tokio::test]
async fn server_wins_policy_keeps_server_edit() {
    let clock = Arc::new(ManualClock::default());
    let remote = Arc::new(InMemoryRemote::new(clock.clone()));
    let store = LocalStore::open(MemoryBackend::new()).unwrap();
    let engine = SyncEngine::builder(store, Arc::clone(&remote))
        .clock(clock.clone())
        .policy(ServerWins)
        .build();

    remote.seed("batches", "42", json!({"status": "poured"}));
    engine.probe().set_link_up(true);
    engine.probe().record_reachability(true);
    engine.gateway().read("batches", "42").await.unwrap();
    engine.probe().set_link_up(false);

    remote.server_edit("batches", "42", &json!({"status": "rejected"}));
    clock.advance(Duration::minutes(5));
    engine
        .gateway()
        .update("batches", "42", json!({"status": "approved"}))
        .await
        .unwrap();

    engine.probe().set_link_up(true);
    let session = engine.manager().sync_now().await.unwrap();
    assert_eq!(session.conflict_count, 1);
    assert_eq!(remote.record("batches", "42").unwrap().data["status"], "rejected");
}

#[tokio::test]
async fn conflict_without_body_is_judged_against_the_fetched_record() {
    let h = harness();
    h.cached_batch().await;
    h.offline();

    h.clock.advance(Duration::minutes(1));
    h.engine.gateway().remove("batches", "42").await.unwrap();
    h.clock.advance(Duration::minutes(1));
    h.remote
        .server_edit("batches", "42", &json!({"status": "rejected"}));
    h.remote.inject(Fault::BareConflict);

    h.online();
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.conflict_count, 1);
    assert!(h.remote.record("batches", "42").is_some());

    // Still there locally, waiting for a resolution
    let entity = h.entity("42").await.unwrap();
    assert!(entity.deleted);
    assert_eq!(entity.sync_state, SyncState::Conflict);
    assert_eq!(entity.held_server.as_ref().map(|r| r.version), Some(2));
}

// ===== Retries and failures =====

#[tokio::test]
async fn transient_failures_back_off_then_fail() {
    let h = harness_with(
        SyncConfig {
            max_attempts: 3,
            ..test_config()
        },
        1,
    );
    let mut events = h.engine.subscribe();
    h.online();
    h.remote.fail_always(Some(Fault::ServerError));

    // First attempt happens on the write itself
    h.engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();
    let op = h.engine.store().list_pending().await.remove(0);
    assert_eq!(op.attempts, 1);
    assert_eq!(op.next_attempt_at, Some(h.clock.now() + Duration::seconds(1)));

    // Not due yet
    h.engine.manager().sync_now().await.unwrap();
    assert_eq!(h.remote.request_count(), 1);

    h.clock.advance(Duration::seconds(1));
    h.engine.manager().sync_now().await.unwrap();
    let op = h.engine.store().operation(op.op_id).await.unwrap();
    assert_eq!(op.attempts, 2);
    assert_eq!(op.next_attempt_at, Some(h.clock.now() + Duration::seconds(2)));
    assert!(h.engine.gateway().failed_operations().await.is_empty());

    h.clock.advance(Duration::seconds(2));
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.failed_count, 1);
    assert_eq!(h.remote.request_count(), 3);

    let failed = h.engine.gateway().failed_operations().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 3);
    assert!(drain_events(&mut events).iter().any(|e| matches!(
        e,
        SyncEvent::OperationFailed { attempts: 3, .. }
    )));

    // Failed operations wait for the user
    h.clock.advance(Duration::minutes(10));
    h.engine.manager().sync_now().await.unwrap();
    assert_eq!(h.remote.request_count(), 3);

    h.remote.fail_always(None);
    h.engine.gateway().retry_failed(op.op_id).await.unwrap();
    assert_eq!(h.engine.gateway().pending_count().await, 0);
    assert_eq!(h.remote.records("batches").len(), 1);
}

#[tokio::test]
async fn discarding_a_failed_create_drops_the_row() {
    let h = harness_with(
        SyncConfig {
            max_attempts: 1,
            ..test_config()
        },
        1,
    );
    h.online();
    h.remote.fail_always(Some(Fault::ServerError));
    h.engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();

    let failed = h.engine.gateway().failed_operations().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, OpKind::Create);

    h.engine.gateway().discard_failed(failed[0].op_id).await.unwrap();
    assert_eq!(h.engine.gateway().pending_count().await, 0);
    assert!(h.entity("tmp-1").await.is_none());

    let err = h.engine.gateway().discard_failed(failed[0].op_id).await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownOperation(_)));
}

#[tokio::test]
async fn going_offline_cancels_the_session() {
    let h = harness();
    h.engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();
    h.remote.inject(Fault::Hang);
    h.online();

    let manager = h.engine.manager().clone();
    let session = tokio::spawn(async move { manager.sync_now().await });
    while h.remote.request_count() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.engine.manager().phase(), SyncPhase::Draining);

    h.offline();
    let session = session.await.unwrap().unwrap();
    assert_eq!(session.outcome, SessionOutcome::Cancelled);
    assert_eq!(h.engine.manager().phase(), SyncPhase::Idle);
    assert!(h.engine.store().metadata().await.last_sync_session_at.is_none());

    // Still queued, retried without an attempt counted against it
    let op = h.engine.store().list_pending().await.remove(0);
    assert_eq!(op.attempts, 0);
    assert!(op.transmitted);

    h.online();
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(h.remote.records("batches").len(), 1);
    assert!(h.engine.store().metadata().await.last_sync_session_at.is_some());
}

#[tokio::test]
async fn sync_is_skipped_while_offline() {
    let h = harness();
    assert!(h.engine.manager().sync_now().await.is_none());
    assert!(h.engine.manager().last_session().is_none());
}

// ===== Refresh =====

#[tokio::test]
async fn refresh_follows_server_for_clean_rows_only() {
    let h = harness();
    h.remote.seed("batches", "1", json!({"status": "poured"}));
    h.remote.seed("batches", "2", json!({"status": "poured"}));
    h.remote.seed("batches", "3", json!({"status": "poured"}));
    h.online();
    h.engine
        .gateway()
        .list("batches", &ListFilter::new())
        .await
        .unwrap();

    h.offline();
    h.engine
        .gateway()
        .update("batches", "3", json!({"status": "approved"}))
        .await
        .unwrap();
    h.remote.server_edit("batches", "1", &json!({"status": "cured"}));
    h.remote.server_delete("batches", "2");

    h.online();
    // Hold the update back so the row stays pending through the refresh
    h.remote.fail_always(Some(Fault::ServerError));
    let session = h.engine.manager().sync_now().await.unwrap();
    assert_eq!(session.outcome, SessionOutcome::Completed);

    assert_eq!(h.entity("1").await.unwrap().payload["status"], "cured");
    assert!(h.entity("2").await.is_none());
    let pending = h.entity("3").await.unwrap();
    assert_eq!(pending.sync_state, SyncState::Pending);
    assert_eq!(pending.payload["status"], "approved");
}

#[tokio::test]
async fn unreachable_server_during_refresh_recovers() {
    let h = harness();
    h.cached_batch().await;
    h.remote.set_reachable(false);

    let session = h.engine.manager().sync_now().await.unwrap();
    assert!(matches!(session.outcome, SessionOutcome::Recovering(_)));
    assert!(h.engine.store().metadata().await.last_sync_session_at.is_none());
    assert_eq!(h.engine.manager().phase(), SyncPhase::Idle);

    // Reads still come from the cache
    let cached = h.engine.gateway().read("batches", "42").await.unwrap();
    assert_eq!(cached.payload["status"], "poured");
}

// ===== Persistence =====

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let device_id = {
        let store = LocalStore::open(FileBackend::new(dir.path()).unwrap()).unwrap();
        let engine = SyncEngine::builder(store, Arc::new(InMemoryRemote::default())).build();
        engine
            .gateway()
            .create("batches", json!({"status": "poured"}))
            .await
            .unwrap();
        engine.store().device_id().await
    };

    let store = LocalStore::open(FileBackend::new(dir.path()).unwrap()).unwrap();
    assert_eq!(store.device_id().await, device_id);
    assert_eq!(store.pending_count().await, 1);

    let remote = Arc::new(InMemoryRemote::default());
    let engine = SyncEngine::builder(store, Arc::clone(&remote)).build();
    let second = engine
        .gateway()
        .create("batches", json!({"status": "cured"}))
        .await
        .unwrap();
    assert_eq!(second.id.as_str(), "tmp-2");

    engine.probe().set_link_up(true);
    engine.probe().record_reachability(true);
    engine.manager().sync_now().await.unwrap();
    assert_eq!(remote.records("batches").len(), 2);
    assert_eq!(engine.gateway().pending_count().await, 0);
}

// ===== Background loop =====

/// Moves forward on every read, as seen by a device whose requests are slow.
struct SteppingClock {
    now: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock().unwrap();
        *now += self.step;
        *now
    }
}

/// Wall time that follows tokio's clock, so paused tests can sleep past
/// backoff deadlines.
struct TokioClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin + Duration::from_std(self.started.elapsed()).unwrap()
    }
}

fn engine_on(clock: Arc<dyn Clock>) -> (SyncEngine<InMemoryRemote>, Arc<InMemoryRemote>) {
    let remote = Arc::new(InMemoryRemote::new(Arc::clone(&clock)));
    let store = LocalStore::open(MemoryBackend::new()).unwrap();
    let engine = SyncEngine::builder(store, Arc::clone(&remote))
        .config(test_config())
        .clock(clock)
        .build();
    (engine, remote)
}

/// Wait up to ten minutes of test time for the queue to empty.
async fn queue_drains(engine: &SyncEngine<InMemoryRemote>) -> bool {
    for _ in 0..600 {
        if engine.gateway().pending_count().await == 0 {
            return true;
        }
        tokio::time::sleep(StdDuration::from_secs(1)).await;
    }
    false
}

#[tokio::test(start_paused = true)]
async fn background_sync_starts_when_connectivity_returns() {
    let h = harness();
    h.engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();

    let tasks = h.engine.spawn_background();
    tokio::time::sleep(StdDuration::from_secs(5)).await;
    assert_eq!(h.remote.request_count(), 0);
    assert!(h.engine.manager().last_session().is_none());

    h.engine.probe().set_link_up(true);
    assert!(queue_drains(&h.engine).await);
    assert_eq!(h.remote.records("batches").len(), 1);
    let session = h.engine.manager().last_session().unwrap();
    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(session.drained_count, 1);

    tasks.shutdown();
}

#[tokio::test(start_paused = true)]
async fn background_sync_catches_up_on_start() {
    let h = harness();
    h.engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();
    h.online();
    assert_eq!(h.remote.request_count(), 0);

    let handle = h.engine.manager().spawn();
    assert!(queue_drains(&h.engine).await);
    assert_eq!(h.remote.records("batches").len(), 1);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn deferred_op_is_retried_once_its_backoff_passes() {
    let clock = Arc::new(TokioClock {
        origin: start_time(),
        started: tokio::time::Instant::now(),
    });
    let (engine, remote) = engine_on(clock);
    engine.probe().set_link_up(true);
    engine.probe().record_reachability(true);
    let handle = engine.manager().spawn();

    remote.inject(Fault::ServerError);
    engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();
    let op = engine.store().list_pending().await.remove(0);
    assert_eq!(op.attempts, 1);

    assert!(queue_drains(&engine).await);
    assert_eq!(remote.request_count(), 2);
    assert_eq!(remote.records("batches").len(), 1);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn backoff_that_expired_during_the_session_is_retried() {
    let clock = Arc::new(SteppingClock {
        now: Mutex::new(start_time()),
        step: Duration::seconds(2),
    });
    let (engine, remote) = engine_on(clock);
    engine
        .gateway()
        .create("batches", json!({"status": "poured"}))
        .await
        .unwrap();
    remote.inject(Fault::ServerError);

    let handle = engine.manager().spawn();
    engine.probe().set_link_up(true);
    engine.probe().record_reachability(true);

    // The 1s backoff is behind the clock by the time the session ends
    assert!(queue_drains(&engine).await);
    assert_eq!(remote.request_count(), 2);
    assert_eq!(remote.write_count(), 1);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn edit_queued_behind_an_immediate_send_is_drained() {
    let h = harness();
    h.cached_batch().await;
    let handle = h.engine.manager().spawn();
    tokio::time::sleep(StdDuration::from_millis(10)).await;

    h.remote.inject(Fault::Slow);
    let gateway = h.engine.gateway().clone();
    let first = tokio::spawn(async move {
        gateway
            .update("batches", "42", json!({"status": "approved"}))
            .await
    });
    while h.remote.request_count() == 0 {
        tokio::task::yield_now().await;
    }

    h.engine
        .gateway()
        .update("batches", "42", json!({"site": "south"}))
        .await
        .unwrap();
    first.await.unwrap().unwrap();

    assert!(queue_drains(&h.engine).await);
    let record = h.remote.record("batches", "42").unwrap();
    assert_eq!(record.version, 3);
    assert_eq!(record.data, json!({"status": "approved", "site": "south"}));
    assert_eq!(h.remote.request_count(), 2);

    handle.abort();
}
