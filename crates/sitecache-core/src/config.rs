//! Tuning knobs for the sync engine.
//!
//! Front ends embed `SyncConfig` in their own configuration file; every field
//! has a default so partial files load.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bound on every network attempt.
/// 10s keeps a hung request from stalling the queue while tolerating slow site links.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// How often the API host is pinged for reachability.
const DEFAULT_PROBE_INTERVAL_MS: u64 = 15_000;

const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;

/// First retry delay; doubles per attempt.
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Retry delays never exceed 5 minutes.
const DEFAULT_BACKOFF_CAP_MS: u64 = 300_000;

const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Attempts before an operation is marked failed and handed to the user.
const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Parallel fetches while refreshing cached entities.
const DEFAULT_REFRESH_CONCURRENCY: usize = 4;

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub request_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction of the delay added or removed at random, 0.0 to disable.
    pub backoff_jitter: f64,
    pub max_attempts: u32,
    pub refresh_concurrency: usize,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            refresh_concurrency: DEFAULT_REFRESH_CONCURRENCY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// A reachability result counts for one interval plus the time a check may take.
    pub fn probe_freshness(&self) -> Duration {
        self.probe_interval() + self.probe_timeout()
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}
