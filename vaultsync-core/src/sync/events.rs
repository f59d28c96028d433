//! Sync event fan-out.
//!
//! Every subscriber sees events in publish order. A subscriber that falls
//! more than the channel capacity behind loses the oldest events and
//! receives a single [`SyncEvent::Resync`] in their place; it should then
//! reread whatever state it mirrors from the cache.

use crate::models::{ItemId, ShareId};
use crate::sync::conflict::{ConflictReport, RejectedChange};
use crate::sync::state::SyncPhase;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Why a scheduled or forced pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    Backgrounded,
    SessionInvalidated,
    BackOff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    LoopStarted,
    LoopStopped,
    SharesChanged {
        added: Vec<ShareId>,
        removed: Vec<ShareId>,
    },
    PassSkipped {
        share_id: Option<ShareId>,
        reason: SkipReason,
    },
    PassStarted {
        share_id: ShareId,
    },
    PhaseChanged {
        share_id: ShareId,
        phase: SyncPhase,
    },
    /// Cached items of a share changed, by sync or by a local mutation.
    ItemsUpdated {
        share_id: ShareId,
        item_ids: Vec<ItemId>,
    },
    /// A listed item could not be decrypted and was not cached.
    ItemUnavailable {
        share_id: ShareId,
        item_id: ItemId,
        reason: String,
    },
    RevisionConflict(ConflictReport),
    /// A local change was refused by the server or lost its item.
    ChangeRejected(RejectedChange),
    PassFinished {
        share_id: ShareId,
        changed: usize,
    },
    PassFailed {
        share_id: ShareId,
        error: String,
    },
    /// Events were dropped for this subscriber.
    Resync {
        missed: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: SyncEvent) {
        trace!(?event, "Publishing sync event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct EventSubscription {
    receiver: broadcast::Receiver<SyncEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the reconciler is dropped.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Sync event subscriber lagged");
                Some(SyncEvent::Resync { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(SyncEvent::Resync { missed })
            }
            Err(_) => None,
        }
    }

    /// Drain every queued event.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
