//! Data model shared by the store, the gateway and the sync manager.
//!
//! - `CachedEntity`, `EntityId`, `SyncState`: the local mirror of server records
//! - `PendingOperation`: queued mutations
//! - `RemoteRecord`: the server's record envelope
//! - `SyncSession`, `SyncEvent`: observability for front ends

pub mod entity;
pub mod event;
pub mod filter;
pub mod operation;
pub mod record;
pub mod session;

pub use entity::{CachedEntity, EntityId, SyncState, Target};
pub use event::SyncEvent;
pub use filter::ListFilter;
pub use operation::{OpKind, OpStatus, PendingOperation};
pub use record::RemoteRecord;
pub use session::{SessionOutcome, SyncSession};
