//! Conflict resolution policies.
//!
//! A policy sees one rejected operation and the server's current record and
//! says what to do next. The sync machinery acts on the verdict; swapping the
//! policy never changes the surrounding state machine.

use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

use crate::models::{OpKind, PendingOperation, RemoteRecord};

/// What the server said about a rejected operation.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    pub op: &'a PendingOperation,
    /// The server's current record, `None` when it no longer exists.
    pub server: Option<&'a RemoteRecord>,
    /// A create whose client id the server already resolved.
    pub duplicate: bool,
    /// The request was already repeated once for this conflict.
    pub retried: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Send the same request again right away
    Retry,
    /// Local edit wins: resend it against this server version
    KeepLocal { against_version: u64 },
    /// Server wins: mark the entity CONFLICT and drop the operation
    KeepServer,
    /// The server already reflects the operation
    AlreadyApplied,
}

pub trait ConflictPolicy: Send + Sync + 'static {
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Verdict;
}

/// Verdicts every policy shares: duplicates and vanished deletes are
/// idempotent successes, a matching version is replication lag.
fn settled(ctx: &ConflictContext<'_>) -> Option<Verdict> {
    if ctx.duplicate {
        return Some(Verdict::AlreadyApplied);
    }
    let Some(server) = ctx.server else {
        return Some(match ctx.op.kind {
            OpKind::Delete => Verdict::AlreadyApplied,
            _ => Verdict::KeepServer,
        });
    };
    if ctx.op.base_version == Some(server.version) {
        return Some(if ctx.retried {
            Verdict::AlreadyApplied
        } else {
            Verdict::Retry
        });
    }
    None
}

/// The later edit survives. The local edit wins when it was made after the
/// server's last modification; ties go to the server.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl ConflictPolicy for LastWriteWins {
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Verdict {
        if let Some(verdict) = settled(ctx) {
            return verdict;
        }
        match ctx.server {
            Some(server) if ctx.op.created_at > server.updated_at => Verdict::KeepLocal {
                against_version: server.version,
            },
            _ => Verdict::KeepServer,
        }
    }
}

/// Never overwrite a server change.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerWins;

impl ConflictPolicy for ServerWins {
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Verdict {
        settled(ctx).unwrap_or(Verdict::KeepServer)
    }
}

/// A user's answer to an entity left in CONFLICT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum Resolution {
    /// Take the server's record
    KeepServer,
    /// Push the local record over the server's
    KeepLocal,
}
