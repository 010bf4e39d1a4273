//! Wiring: one store, one remote, one probe, shared by the gateway and the
//! sync manager.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::{ConflictPolicy, LastWriteWins};
use crate::gateway::Gateway;
use crate::models::SyncEvent;
use crate::probe::NetworkProbe;
use crate::remote::{RemoteApi, RemoteError};
use crate::store::LocalStore;
use crate::sync::{Backoff, Inflight, SyncManager};

/// State the gateway and the sync manager both work on.
pub(crate) struct Shared<R: RemoteApi> {
    pub store: LocalStore,
    pub remote: Arc<R>,
    pub probe: Arc<NetworkProbe>,
    pub events: broadcast::Sender<SyncEvent>,
    pub inflight: Inflight,
    pub clock: Arc<dyn Clock>,
    pub policy: Box<dyn ConflictPolicy>,
    pub config: SyncConfig,
    pub backoff: Backoff,
    /// Nudges the background loop when queued work is waiting
    pub wake: Notify,
}

impl<R: RemoteApi> Shared<R> {
    pub fn emit(&self, events: impl IntoIterator<Item = SyncEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Bound a remote call by the request timeout.
    pub async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        let timeout = self.config.request_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| Err(RemoteError::Timeout(timeout)))
    }
}

pub struct EngineBuilder<R: RemoteApi> {
    store: LocalStore,
    remote: Arc<R>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    policy: Box<dyn ConflictPolicy>,
    probe: Option<Arc<NetworkProbe>>,
}

impl<R: RemoteApi> EngineBuilder<R> {
    pub fn new(store: LocalStore, remote: Arc<R>) -> Self {
        Self {
            store,
            remote,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            policy: Box::new(LastWriteWins),
            probe: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(mut self, policy: impl ConflictPolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Use an existing probe instead of a fresh one sized from the config.
    pub fn probe(mut self, probe: Arc<NetworkProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> SyncEngine<R> {
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(NetworkProbe::new(self.config.probe_freshness())));
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let backoff = Backoff::new(
            self.config.backoff_base(),
            self.config.backoff_cap(),
            self.config.backoff_jitter,
        );

        let shared = Arc::new(Shared {
            store: self.store,
            remote: self.remote,
            probe,
            events,
            inflight: Inflight::default(),
            clock: self.clock,
            policy: self.policy,
            config: self.config,
            backoff,
            wake: Notify::new(),
        });

        SyncEngine {
            gateway: Gateway::new(Arc::clone(&shared)),
            manager: SyncManager::new(Arc::clone(&shared)),
            shared,
        }
    }
}

/// The assembled engine. Front ends read and write through `gateway()`,
/// observe through `subscribe()`, and call `spawn_background()` once.
pub struct SyncEngine<R: RemoteApi> {
    shared: Arc<Shared<R>>,
    gateway: Gateway<R>,
    manager: SyncManager<R>,
}

impl<R: RemoteApi> SyncEngine<R> {
    pub fn builder(store: LocalStore, remote: Arc<R>) -> EngineBuilder<R> {
        EngineBuilder::new(store, remote)
    }

    pub fn gateway(&self) -> &Gateway<R> {
        &self.gateway
    }

    pub fn manager(&self) -> &SyncManager<R> {
        &self.manager
    }

    pub fn probe(&self) -> &Arc<NetworkProbe> {
        &self.shared.probe
    }

    pub fn store(&self) -> &LocalStore {
        &self.shared.store
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.shared.remote
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Start the reachability checks and the sync loop.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let config = &self.shared.config;
        let probe = self.shared.probe.spawn_reachability_checks(
            Arc::clone(&self.shared.remote),
            config.probe_interval(),
            config.probe_timeout(),
        );
        let sync = self.manager.spawn();
        info!("Background sync started");
        BackgroundTasks {
            handles: vec![probe, sync],
        }
    }
}

/// Handles of the background tasks. Dropping them leaves the tasks running;
/// call `shutdown` to stop them.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
