use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::replay::{went_offline, Outcome};
use crate::engine::Shared;
use crate::models::{OpStatus, RemoteRecord, SessionOutcome, SyncEvent, SyncSession, Target};
use crate::remote::{RemoteApi, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum SyncPhase {
    Idle,
    Draining,
    Refreshing,
    Recovering,
}

/// How a session step ended.
enum Step {
    Done,
    Cancelled,
    Failed(String),
}

struct ManagerState {
    running: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    last_session: Mutex<Option<SyncSession>>,
}

/// Runs synchronization sessions: drain the mutation queue, then refresh
/// cached entities from the server. One session at a time.
pub struct SyncManager<R: RemoteApi> {
    shared: Arc<Shared<R>>,
    state: Arc<ManagerState>,
}

impl<R: RemoteApi> Clone for SyncManager<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            state: Arc::clone(&self.state),
        }
    }
}

/// Clears the running flag however the session ends, including when the
/// session future is dropped.
struct RunningGuard<'a>(&'a ManagerState);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.phase.send_replace(SyncPhase::Idle);
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl<R: RemoteApi> SyncManager<R> {
    pub(crate) fn new(shared: Arc<Shared<R>>) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            shared,
            state: Arc::new(ManagerState {
                running: AtomicBool::new(false),
                phase,
                last_session: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.state.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.state.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// The most recent session, whatever its outcome.
    pub fn last_session(&self) -> Option<SyncSession> {
        self.state
            .last_session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask the background loop for a session.
    pub fn trigger(&self) {
        self.shared.wake.notify_one();
    }

    /// Run one session now. Returns `None` without doing anything when
    /// offline or when a session is already running.
    pub async fn sync_now(&self) -> Option<SyncSession> {
        if !self.shared.probe.is_online() {
            debug!("Offline, no sync session");
            return None;
        }
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync session already running");
            return None;
        }
        let _running = RunningGuard(&self.state);

        let mut session = SyncSession::start(self.shared.clock.now());
        let pending = self.shared.store.pending_count().await;
        info!(pending, "Sync session started");

        let outcome = self.run(&mut session).await;
        let completed_at = self.shared.clock.now();
        session.finish(completed_at, outcome);

        if session.is_completed() {
            if let Err(e) = self.shared.store.record_session(completed_at).await {
                error!(error = %e, "Failed to persist session time");
            }
        }
        info!(
            drained = session.drained_count,
            conflicts = session.conflict_count,
            failed = session.failed_count,
            outcome = ?session.outcome,
            "Sync session finished"
        );

        *self
            .state
            .last_session
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        self.shared.emit([SyncEvent::SessionCompleted(session.clone())]);
        Some(session)
    }

    async fn run(&self, session: &mut SyncSession) -> SessionOutcome {
        self.state.phase.send_replace(SyncPhase::Draining);
        match self.drain(session).await {
            Step::Done => {}
            Step::Cancelled => return SessionOutcome::Cancelled,
            Step::Failed(e) => return self.recover(e),
        }

        self.state.phase.send_replace(SyncPhase::Refreshing);
        match self.refresh().await {
            Step::Done => SessionOutcome::Completed,
            Step::Cancelled => SessionOutcome::Cancelled,
            Step::Failed(e) => self.recover(e),
        }
    }

    fn recover(&self, error: String) -> SessionOutcome {
        self.state.phase.send_replace(SyncPhase::Recovering);
        error!(error = %error, "Sync session failed");
        SessionOutcome::Recovering(error)
    }

    // ===== Draining =====

    /// Replay queued operations in op id order. Each target's head op goes
    /// first; a target whose op was deferred is skipped for the rest of the
    /// pass while other targets continue.
    async fn drain(&self, session: &mut SyncSession) -> Step {
        let mut blocked: HashSet<Target> = HashSet::new();

        loop {
            if !self.shared.probe.is_online() {
                return Step::Cancelled;
            }
            let Some(op_id) = self.next_op(&blocked).await else {
                return Step::Done;
            };
            let Some(op) = self.shared.store.operation(op_id).await else {
                continue;
            };
            let target = op.target();

            // A gateway send on the same target keeps it busy
            let Some(_claim) = self.shared.inflight.try_claim(target.clone()) else {
                debug!(op_id, entity = %target, "Target busy, skipping this pass");
                blocked.insert(target);
                continue;
            };

            let outcome = match self.shared.replay(op_id).await {
                Ok(outcome) => outcome,
                Err(e) => return Step::Failed(e.to_string()),
            };
            match outcome {
                Outcome::Acknowledged => session.drained_count += 1,
                Outcome::Conflict => session.conflict_count += 1,
                Outcome::Failed => {
                    session.failed_count += 1;
                    blocked.insert(target);
                }
                Outcome::Deferred | Outcome::Skipped => {
                    blocked.insert(target);
                }
                Outcome::Cancelled => return Step::Cancelled,
            }
        }
    }

    /// Lowest op id that heads its target, is due, and is not blocked.
    async fn next_op(&self, blocked: &HashSet<Target>) -> Option<u64> {
        let now = self.shared.clock.now();
        self.shared
            .store
            .read(|t| {
                let mut seen: HashSet<Target> = HashSet::new();
                t.pending_operations.values().find_map(|op| {
                    let target = op.target();
                    if !seen.insert(target.clone()) {
                        return None;
                    }
                    (op.is_due(now) && !blocked.contains(&target)).then_some(op.op_id)
                })
            })
            .await
    }

    // ===== Refreshing =====

    /// Re-fetch every cached entity that has a server id.
    async fn refresh(&self) -> Step {
        let targets: Vec<Target> = self
            .shared
            .store
            .read(|t| {
                t.entities
                    .values()
                    .flat_map(|rows| rows.values())
                    .filter(|e| !e.is_local_only())
                    .map(|e| e.target())
                    .collect()
            })
            .await;
        if targets.is_empty() {
            return Step::Done;
        }
        debug!(count = targets.len(), "Refreshing cached entities");

        let concurrency = self.shared.config.refresh_concurrency.max(1);
        let fetches = stream::iter(targets)
            .map(|target| async move {
                let result = self
                    .shared
                    .bounded(self.shared.remote.fetch(&target.collection, &target.id))
                    .await;
                (target, result)
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<(Target, Result<RemoteRecord, RemoteError>)>>();

        let mut online = self.shared.probe.subscribe();
        let results = tokio::select! {
            results = fetches => results,
            _ = went_offline(&mut online) => return Step::Cancelled,
        };

        let mut failures = Vec::new();
        let applied = self
            .shared
            .store
            .commit(|t| {
                let mut events = Vec::new();
                for (target, result) in results {
                    match result {
                        Ok(record) => events.extend(t.apply_remote(&target.collection, &record)),
                        Err(RemoteError::NotFound(_)) => {
                            events.extend(t.drop_missing(&target.collection, &target.id))
                        }
                        Err(e) => failures.push(format!("{}: {}", target, e)),
                    }
                }
                events
            })
            .await;

        match applied {
            Ok(events) => self.shared.emit(events),
            Err(e) => return Step::Failed(e.to_string()),
        }
        match failures.first() {
            None => Step::Done,
            Some(first) => {
                warn!(failed = failures.len(), "Some entities could not be refreshed");
                Step::Failed(format!("{} refreshes failed, first: {}", failures.len(), first))
            }
        }
    }

    // ===== Background loop =====

    /// Start sessions on online transitions, explicit triggers, and when the
    /// earliest backoff deadline passes.
    pub fn spawn(&self) -> JoinHandle<()> {
        let manager = self.clone();
        // Catch up on work queued before the loop started
        manager.trigger();

        tokio::spawn(async move {
            let mut online = manager.shared.probe.subscribe();
            loop {
                let backoff = manager.until_next_deadline().await;
                tokio::select! {
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online.borrow_and_update() {
                            continue;
                        }
                    }
                    _ = manager.shared.wake.notified() => {}
                    _ = sleep_or_forever(backoff) => {}
                }
                if manager.sync_now().await.is_none() && manager.is_running() {
                    // Someone else's session; look again once it ends
                    let mut phase = manager.watch_phase();
                    let _ = phase.wait_for(|p| *p == SyncPhase::Idle).await;
                }
            }
        })
    }

    /// Time until the earliest deferred op becomes due, zero when one is
    /// already overdue. `None` while offline or with nothing deferred; an
    /// online transition or a wake starts the next session then.
    async fn until_next_deadline(&self) -> Option<Duration> {
        if !self.shared.probe.is_online() {
            return None;
        }
        let inflight = &self.shared.inflight;
        let next = self
            .shared
            .store
            .read(|t| {
                let mut seen: HashSet<Target> = HashSet::new();
                t.pending_operations
                    .values()
                    .filter(|op| seen.insert(op.target()))
                    .filter(|op| op.status == OpStatus::Queued)
                    // A busy target wakes the loop when its send finishes
                    .filter(|op| !inflight.contains(&op.target()))
                    .filter_map(|op| op.next_attempt_at)
                    .min()
            })
            .await?;
        Some((next - self.shared.clock.now()).to_std().unwrap_or_default())
    }
}

async fn sleep_or_forever(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
