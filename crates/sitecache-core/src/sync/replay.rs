use tokio::sync::watch;
use tracing::{debug, warn};

use crate::conflict::{ConflictContext, Verdict};
use crate::engine::Shared;
use crate::models::{OpKind, PendingOperation, RemoteRecord};
use crate::remote::{RemoteApi, RemoteError};
use crate::store::{Ack, StoreError};

/// Conflict verdicts that send the request again before giving up for now.
const MAX_CONFLICT_ROUNDS: usize = 4;

/// How one transmission of a queued operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acknowledged,
    /// The server side won; the entity is in CONFLICT
    Conflict,
    /// Transient failure, retried after backoff
    Deferred,
    /// Needs a user to retry or discard it
    Failed,
    /// Connectivity dropped while waiting for the answer
    Cancelled,
    /// Nothing to send: the op was settled or is not queued
    Skipped,
}

/// Resolves once the online flag turns false.
pub(crate) async fn went_offline(online: &mut watch::Receiver<bool>) {
    let closed = online.wait_for(|up| !*up).await.is_err();
    if closed {
        // Probe dropped: nothing will cancel us
        std::future::pending::<()>().await;
    }
}

impl<R: RemoteApi> Shared<R> {
    /// Transmit one queued operation and settle the answer in the store.
    /// The caller holds the inflight claim on the op's target.
    pub(crate) async fn replay(&self, op_id: u64) -> Result<Outcome, StoreError> {
        let Some(mut op) = self.store.commit(|t| t.begin_attempt(op_id)).await? else {
            return Ok(Outcome::Skipped);
        };
        let mut retried = false;

        for _ in 0..MAX_CONFLICT_ROUNDS {
            let Some(result) = self.transmit(&op).await else {
                debug!(op_id, "Attempt abandoned, connectivity lost");
                return Ok(Outcome::Cancelled);
            };

            let (server, duplicate) = match result {
                Ok(ack) => return self.settle(op_id, ack).await,
                Err(RemoteError::AlreadyExists(record)) => (Some(*record), true),
                Err(RemoteError::Conflict {
                    current: Some(record),
                }) => (Some(*record), false),
                // Rejected without the current record: look it up before judging
                Err(RemoteError::Conflict { current: None }) if op.kind != OpKind::Create => {
                    match self.server_record(&op).await {
                        Ok(server) => (server, false),
                        Err(e) if e.is_transient() => {
                            return self.schedule_retry(&op, e.to_string()).await
                        }
                        Err(e) => return self.fail(&op, op.attempts + 1, e.to_string()).await,
                    }
                }
                Err(RemoteError::Conflict { current: None }) => (None, false),
                Err(RemoteError::NotFound(_)) if op.kind != OpKind::Create => (None, false),
                Err(e) if e.is_transient() => return self.schedule_retry(&op, e.to_string()).await,
                Err(e) => return self.fail(&op, op.attempts + 1, e.to_string()).await,
            };

            let verdict = self.policy.resolve(&ConflictContext {
                op: &op,
                server: server.as_ref(),
                duplicate,
                retried,
            });
            match verdict {
                Verdict::Retry => {
                    debug!(op_id, "Stale conflict, retrying once");
                    retried = true;
                }
                Verdict::KeepLocal { against_version } => {
                    warn!(op_id, entity = %op.target(), against_version, "Local edit is newer, resending");
                    op.base_version = Some(against_version);
                    self.store
                        .commit(|t| t.set_base_version(op_id, against_version))
                        .await?;
                    retried = false;
                }
                Verdict::KeepServer => {
                    warn!(op_id, entity = %op.target(), "Server edit wins, entity left in conflict");
                    let events = self.store.commit(|t| t.mark_conflict(op_id, server)).await?;
                    self.emit(events);
                    return Ok(Outcome::Conflict);
                }
                Verdict::AlreadyApplied => {
                    debug!(op_id, entity = %op.target(), "Server already reflects operation");
                    let ack = match server {
                        Some(record) if op.kind != OpKind::Delete => Ack::Record(record),
                        _ => Ack::Deleted,
                    };
                    return self.settle(op_id, ack).await;
                }
            }
        }

        self.schedule_retry(&op, "conflict did not settle".to_string())
            .await
    }

    /// Send the op, bounded by the request timeout and abandoned if the
    /// probe reports offline meanwhile. `None` means abandoned.
    async fn transmit(&self, op: &PendingOperation) -> Option<Result<Ack, RemoteError>> {
        if !self.probe.is_online() {
            return None;
        }
        let mut online = self.probe.subscribe();

        let request = async {
            match op.kind {
                OpKind::Create => self
                    .remote
                    .create(&op.collection, op.target_id.as_str(), &op.payload)
                    .await
                    .map(Ack::Record),
                OpKind::Update => self
                    .remote
                    .update(&op.collection, &op.target_id, &op.payload, op.base_version)
                    .await
                    .map(Ack::Record),
                OpKind::Delete => self
                    .remote
                    .delete(&op.collection, &op.target_id, op.base_version)
                    .await
                    .map(|()| Ack::Deleted),
            }
        };

        tokio::select! {
            result = self.bounded(request) => Some(result),
            _ = went_offline(&mut online) => None,
        }
    }

    /// The server's current copy of the op's target; `None` only when the
    /// server answers that it does not exist.
    async fn server_record(&self, op: &PendingOperation) -> Result<Option<RemoteRecord>, RemoteError> {
        match self
            .bounded(self.remote.fetch(&op.collection, &op.target_id))
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn settle(&self, op_id: u64, ack: Ack) -> Result<Outcome, StoreError> {
        let events = self.store.commit(|t| t.acknowledge(op_id, ack)).await?;
        debug!(op_id, "Operation acknowledged");
        self.emit(events);
        Ok(Outcome::Acknowledged)
    }

    async fn schedule_retry(&self, op: &PendingOperation, error: String) -> Result<Outcome, StoreError> {
        let attempts = op.attempts + 1;
        if attempts >= self.config.max_attempts {
            return self.fail(op, attempts, error).await;
        }

        let delay = self.backoff.delay(attempts);
        let now = self.clock.now();
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        warn!(
            op_id = op.op_id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transmission failed, backing off"
        );
        self.store
            .commit(|t| t.defer(op.op_id, attempts, error, next_attempt_at))
            .await?;
        Ok(Outcome::Deferred)
    }

    async fn fail(&self, op: &PendingOperation, attempts: u32, error: String) -> Result<Outcome, StoreError> {
        warn!(op_id = op.op_id, attempts, error = %error, "Operation failed, waiting for user action");
        let event = self
            .store
            .commit(|t| t.mark_failed(op.op_id, attempts, error))
            .await?;
        self.emit(event);
        Ok(Outcome::Failed)
    }
}
