//! Revision-based conflict resolution between cached and listed items.

use crate::models::{ItemId, ItemRevision, ShareId};
use crate::VaultSyncError;
use serde::Serialize;

/// Outcome of comparing a listed revision with the cached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Replace the cached copy with the listed revision.
    AcceptRemote,
    /// Keep the cached copy.
    KeepLocal,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve a listed revision against the cached copy of the same item.
    ///
    /// 1. A cached copy with an unpushed local change is kept; the outbox
    ///    reconciles it with the server on push.
    /// 2. A strictly higher remote revision wins.
    /// 3. Anything else keeps the cached copy.
    pub fn resolve(local_revision: i64, local_pending: bool, remote: &ItemRevision) -> Resolution {
        if local_pending {
            Resolution::KeepLocal
        } else if remote.revision > local_revision {
            Resolution::AcceptRemote
        } else {
            Resolution::KeepLocal
        }
    }

    /// Whether a listed item we have no copy of should be cached.
    pub fn accept_new(remote: &ItemRevision) -> bool {
        // servers number revisions from 1
        remote.revision > 0
    }
}

/// How a held conflict is settled under the manual policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Push the local change again on top of the current remote revision.
    KeepLocal,
    /// Discard the local change and cache the current remote revision.
    KeepRemote,
}

/// A push that still conflicted after one rebase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub share_id: ShareId,
    pub item_id: ItemId,
    pub base_revision: i64,
    pub remote_revision: i64,
    /// True when the local change was kept for manual resolution.
    pub held: bool,
}

/// A local change the server refused, or whose item no longer exists there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedChange {
    pub share_id: ShareId,
    pub item_id: ItemId,
    /// Kind of the change, e.g. `create` or `trash`.
    pub change: String,
    pub reason: String,
    /// True when the change stays queued until resolved with
    /// `resolve_conflict`; false when it was dropped.
    pub held: bool,
}

impl ConflictReport {
    pub fn to_error(&self) -> VaultSyncError {
        VaultSyncError::RevisionConflict {
            share_id: self.share_id.clone(),
            item_id: self.item_id.clone(),
            base_revision: self.base_revision,
            remote_revision: self.remote_revision,
        }
    }
}
