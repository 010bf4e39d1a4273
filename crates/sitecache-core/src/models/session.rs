use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind", content = "error")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum SessionOutcome {
    Running,
    Completed,
    /// Connectivity dropped mid-session
    Cancelled,
    /// A storage or refresh failure ended the session early
    Recovering(String),
}

/// One synchronization pass. Kept in memory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct SyncSession {
    pub started_at: DateTime<Utc>,
    pub drained_count: usize,
    pub conflict_count: usize,
    pub failed_count: usize,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: SessionOutcome,
}

impl SyncSession {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            drained_count: 0,
            conflict_count: 0,
            failed_count: 0,
            completed_at: None,
            outcome: SessionOutcome::Running,
        }
    }

    pub fn finish(&mut self, now: DateTime<Utc>, outcome: SessionOutcome) {
        self.completed_at = Some(now);
        self.outcome = outcome;
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == SessionOutcome::Completed
    }
}
