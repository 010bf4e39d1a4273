//! Online/offline detection.
//!
//! The link signal alone is not enough: a device can have a network while the
//! API host is unreachable. The probe reports online only while the link is
//! up AND a reachability check succeeded within the freshness window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::remote::RemoteApi;

type Listener = Box<dyn Fn(bool) + Send + Sync>;

pub struct NetworkProbe {
    link_up: AtomicBool,
    last_reachable: Mutex<Option<Instant>>,
    freshness: Duration,
    online: watch::Sender<bool>,
    listeners: Mutex<Vec<Listener>>,
}

impl NetworkProbe {
    /// A probe that starts offline. `freshness` is how long a successful
    /// reachability check counts.
    pub fn new(freshness: Duration) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            link_up: AtomicBool::new(false),
            last_reachable: Mutex::new(None),
            freshness,
            online,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Current state. Never waits on anything.
    pub fn is_online(&self) -> bool {
        if !self.link_up.load(Ordering::SeqCst) {
            return false;
        }
        self.last_reachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map_or(false, |at| at.elapsed() <= self.freshness)
    }

    /// Feed the platform's link signal.
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
        debug!(up, "Link state changed");
        self.publish();
    }

    /// Record the result of a reachability check against the API host.
    pub fn record_reachability(&self, reachable: bool) {
        {
            let mut last = self.last_reachable.lock().unwrap_or_else(|e| e.into_inner());
            *last = if reachable { Some(Instant::now()) } else { None };
        }
        self.publish();
    }

    /// Register a callback for online/offline transitions. Repeated identical
    /// states are not reported. Callbacks run on the notifying task and must
    /// not block.
    pub fn on_change(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }

    /// Watch channel carrying the online flag, for `select!` loops.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    fn publish(&self) {
        let online = self.is_online();
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        if online {
            info!("Network online");
        } else {
            warn!("Network offline");
        }
        for listener in self.listeners.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            listener(online);
        }
    }

    /// Ping the API host every `interval`, bounding each check by `timeout`.
    pub fn spawn_reachability_checks<R: RemoteApi>(
        self: &Arc<Self>,
        remote: Arc<R>,
        interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = match tokio::time::timeout(timeout, remote.ping()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(error = %e, "Reachability check failed");
                        false
                    }
                    Err(_) => {
                        debug!(?timeout, "Reachability check timed out");
                        false
                    }
                };
                probe.record_reachability(reachable);
            }
        })
    }
}
