use thiserror::Error;

use crate::models::PendingOperation;
use crate::remote::RemoteError;
use crate::store::StoreError;

/// Errors surfaced to callers of the gateway.
///
/// Transient network failures never show up here for writes: they are
/// absorbed into the mutation queue and reported later on the event stream.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A durable write could not be completed. Nothing was recorded.
    #[error("Storage failure: {0}")]
    StorageFailure(#[from] StoreError),

    #[error("{0} is not cached and the server cannot be reached")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} is in conflict - resolve it before editing")]
    Conflict(String),

    #[error("Operation {op_id} failed after {attempts} attempts: {error}")]
    ExhaustedRetries {
        op_id: u64,
        attempts: u32,
        error: String,
    },

    #[error("{0} has no conflict to resolve")]
    NotInConflict(String),

    #[error("No failed operation with id {0}")]
    UnknownOperation(u64),

    #[error("Server rejected the request: {0}")]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// What a failed queued operation reports to the user.
    pub fn exhausted(op: &PendingOperation) -> Self {
        SyncError::ExhaustedRetries {
            op_id: op.op_id,
            attempts: op.attempts,
            error: op
                .last_error
                .clone()
                .unwrap_or_else(|| "rejected by server".to_string()),
        }
    }
}
