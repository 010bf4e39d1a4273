//! Queue replay and the sync session state machine.
//!
//! ```text
//! IDLE -> DRAINING -> REFRESHING -> IDLE
//!             \            \
//!              +------------+--> RECOVERING -> IDLE
//! ```

mod backoff;
mod inflight;
mod manager;
mod replay;

pub use backoff::Backoff;
pub use inflight::{Inflight, InflightGuard};
pub use manager::{SyncManager, SyncPhase};
