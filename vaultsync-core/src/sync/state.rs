//! Per-share sync phase machine.
//!
//! ```text
//! Idle ─► Fetching ─► Diffing ─► Applying ─► Idle
//!            ▲                      │
//!            └──── next page ───────┘
//! any ─► Error ─(back-off elapsed)─► Idle
//! ```

use crate::sync::backoff::BackOffManager;
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Diffing,
    Applying,
    Error,
}

impl SyncPhase {
    pub fn can_transition_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Diffing)
                | (Diffing, Applying)
                | (Applying, Fetching)
                | (Applying, Diffing)
                | (Applying, Idle)
                | (_, Error)
                | (Error, Idle)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Fetching | Self::Diffing | Self::Applying)
    }
}

/// Phase, back-off and last failure of one share.
#[derive(Debug, Clone)]
pub struct ShareSyncState {
    phase: SyncPhase,
    backoff: BackOffManager,
    last_error: Option<String>,
}

impl Default for ShareSyncState {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            backoff: BackOffManager::new(),
            last_error: None,
        }
    }
}

impl ShareSyncState {
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn backoff(&self) -> &BackOffManager {
        &self.backoff
    }

    /// Move to `next` if the move is legal. Illegal moves are logged and ignored.
    pub fn transition(&mut self, next: SyncPhase) -> bool {
        if self.phase == next {
            return true;
        }
        if !self.phase.can_transition_to(next) {
            warn!(from = ?self.phase, to = ?next, "Ignoring illegal sync phase transition");
            return false;
        }
        self.phase = next;
        true
    }

    pub fn succeed(&mut self) {
        self.backoff.record_success();
        self.last_error = None;
        self.transition(SyncPhase::Idle);
    }

    pub fn fail(&mut self, error: String, now: Instant) {
        self.backoff.record_failure(now);
        self.last_error = Some(error);
        self.transition(SyncPhase::Error);
    }

    /// Back to Idle without recording anything, after cancellation.
    pub fn force_idle(&mut self) {
        self.phase = SyncPhase::Idle;
    }

    /// Leave Error once the back-off has elapsed. Returns whether a pass may start.
    pub fn refresh(&mut self, now: Instant) -> bool {
        if self.phase == SyncPhase::Error && self.backoff.can_proceed(now) {
            self.transition(SyncPhase::Idle);
        }
        self.phase != SyncPhase::Error
    }
}
