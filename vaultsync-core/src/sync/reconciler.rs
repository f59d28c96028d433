//! Sync scheduling: the timer loop, one pass at a time per share, pausing
//! and cancellation.

use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::device_key::SymmetricKeyProvider;
use crate::keys::KeyHierarchyManager;
use crate::models::{ItemId, ShareId};
use crate::remote::RemoteSyncClient;
use crate::session::{SessionMonitor, SessionState};
use crate::sync::conflict::{ConflictReport, RejectedChange};
use crate::sync::events::{EventBus, EventSubscription, SkipReason, SyncEvent};
use crate::sync::state::{ShareSyncState, SyncPhase};
use crate::{Result, VaultSyncError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Platform reachability, fed by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    pub online: bool,
    pub foreground: bool,
}

impl Connectivity {
    pub const ONLINE: Self = Self {
        online: true,
        foreground: true,
    };
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::ONLINE
    }
}

/// How one requested pass of a share ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassResult {
    Synced {
        changed: usize,
        conflicts: Vec<ConflictReport>,
        rejected: Vec<RejectedChange>,
    },
    Failed(String),
    Skipped(SkipReason),
    Cancelled,
}

impl PassResult {
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced { .. })
    }
}

/// Collaborators of a [`SyncReconciler`].
pub struct SyncDependencies {
    pub remote: Arc<RemoteSyncClient>,
    pub keys: Arc<KeyHierarchyManager>,
    pub cache: LocalCache,
    pub device_key: Arc<SymmetricKeyProvider>,
    pub session: Arc<SessionMonitor>,
    pub connectivity: watch::Receiver<Connectivity>,
}

#[derive(Debug, Default)]
pub(super) struct PassSummary {
    pub(super) changed: Vec<ItemId>,
    pub(super) conflicts: Vec<ConflictReport>,
    pub(super) rejected: Vec<RejectedChange>,
}

#[derive(Debug, Clone, Default)]
struct Progress {
    completed: u64,
    epoch: u64,
    last: Option<PassResult>,
}

struct ShareSlot {
    state: ShareSyncState,
    running: bool,
    rerun: bool,
    epoch: u64,
    driver: Option<JoinHandle<()>>,
    /// Aborted driver; the next driver waits for it to wind down.
    stale_driver: Option<JoinHandle<()>>,
    progress: watch::Sender<Progress>,
}

impl ShareSlot {
    fn new() -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            state: ShareSyncState::default(),
            running: false,
            rerun: false,
            epoch: 0,
            driver: None,
            stale_driver: None,
            progress,
        }
    }

    fn cancel(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
            self.stale_driver = Some(driver);
        }
        self.running = false;
        self.rerun = false;
        self.epoch += 1;
        self.state.force_idle();
        let epoch = self.epoch;
        self.progress.send_modify(|progress| progress.epoch = epoch);
    }
}

enum Ticket {
    Ready(PassResult),
    Waiting {
        progress: watch::Receiver<Progress>,
        target: u64,
        epoch: u64,
    },
}

impl Ticket {
    async fn wait(self) -> PassResult {
        match self {
            Ticket::Ready(result) => result,
            Ticket::Waiting {
                mut progress,
                target,
                epoch,
            } => {
                let outcome = progress
                    .wait_for(|p| p.completed >= target || p.epoch != epoch)
                    .await;
                match outcome {
                    Ok(p) if p.epoch == epoch => p.last.clone().unwrap_or(PassResult::Cancelled),
                    _ => PassResult::Cancelled,
                }
            }
        }
    }
}

pub(super) struct Inner {
    pub(super) config: SyncConfig,
    pub(super) remote: Arc<RemoteSyncClient>,
    pub(super) keys: Arc<KeyHierarchyManager>,
    pub(super) cache: LocalCache,
    pub(super) device_key: Arc<SymmetricKeyProvider>,
    pub(super) session: Arc<SessionMonitor>,
    pub(super) events: EventBus,
    connectivity: watch::Receiver<Connectivity>,
    permits: Semaphore,
    slots: Mutex<HashMap<ShareId, ShareSlot>>,
    local_locks: Mutex<HashMap<ShareId, Arc<tokio::sync::Mutex<()>>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the local cache of every share converged with the server.
///
/// Each share runs at most one pass at a time. Requests arriving while a
/// pass is in flight coalesce into a single follow-up pass. Passes of
/// different shares run concurrently, bounded by
/// [`SyncConfig::max_concurrent_shares`].
#[derive(Clone)]
pub struct SyncReconciler {
    pub(super) inner: Arc<Inner>,
}

impl SyncReconciler {
    pub fn new(config: SyncConfig, deps: SyncDependencies) -> Self {
        let permits = Semaphore::new(config.max_concurrent_shares.max(1));
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                remote: deps.remote,
                keys: deps.keys,
                cache: deps.cache,
                device_key: deps.device_key,
                session: deps.session,
                events,
                connectivity: deps.connectivity,
                permits,
                slots: Mutex::new(HashMap::new()),
                local_locks: Mutex::new(HashMap::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    pub fn phase(&self, share_id: &ShareId) -> SyncPhase {
        lock(&self.inner.slots)
            .get(share_id)
            .map(|slot| slot.state.phase())
            .unwrap_or(SyncPhase::Idle)
    }

    /// Message of the last failed pass of a share, cleared by a successful one.
    pub fn last_error(&self, share_id: &ShareId) -> Option<String> {
        lock(&self.inner.slots)
            .get(share_id)
            .and_then(|slot| slot.state.last_error().map(str::to_string))
    }

    /// Start the periodic loop. The first pass runs immediately.
    pub fn start(&self) {
        let mut timer = lock(&self.inner.timer);
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Sync loop already running");
            return;
        }
        let inner = self.inner.clone();
        *timer = Some(tokio::spawn(inner.run_loop()));
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.timer)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Request an immediate pass of every known share without waiting for it.
    /// Requests made while a pass is in flight coalesce into one more pass.
    pub fn force_sync(&self) {
        if let Some(reason) = self.inner.blocked_reason() {
            self.inner.skip(None, reason);
            return;
        }
        let known = self.inner.known_shares();
        if known.is_empty() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.sync_all(true).await {
                    warn!(error = %e, "Forced sync failed");
                }
            });
            return;
        }
        for share_id in known {
            // the caller does not wait; the ticket is dropped
            let _ = self.inner.request_pass(&share_id, true);
        }
    }

    /// Refresh the share list and sync every share, waiting for the passes.
    pub async fn sync_now(&self) -> Result<Vec<(ShareId, PassResult)>> {
        self.inner.sync_all(true).await
    }

    /// Sync one share and wait for the pass.
    pub async fn sync_share(&self, share_id: &ShareId) -> PassResult {
        if let Some(reason) = self.inner.blocked_reason() {
            self.inner.skip(Some(share_id), reason);
            return PassResult::Skipped(reason);
        }
        self.inner.request_pass(share_id, true).wait().await
    }

    /// Stop the loop and cancel in-flight passes. Cursors are kept, so the
    /// next pass resumes where the cancelled one stopped.
    pub fn stop(&self) {
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
        self.inner.cancel_passes();
        info!("Sync stopped");
        self.inner.events.publish(SyncEvent::LoopStopped);
    }

    /// Cancel any pass of `share_id` and wait for it to wind down, then drop
    /// the share's items, cursor, queued changes and keys.
    pub async fn remove_share(&self, share_id: &ShareId) -> Result<()> {
        self.inner.evict_share(share_id).await
    }

    /// Stop, then forget every cursor so the next pass starts from scratch.
    pub async fn reset(&self) -> Result<()> {
        self.stop();
        self.inner.wind_down().await;
        self.inner.cache.clear_cursors().await?;
        info!("Sync state reset");
        Ok(())
    }

    /// Stop and wipe every local secret: cached keys, the local cache and
    /// the device key.
    pub async fn logout(&self) -> Result<()> {
        self.stop();
        self.inner.wind_down().await;
        self.inner.keys.wipe();
        self.inner.cache.clear_all().await?;
        self.inner.device_key.wipe().await?;
        info!("Local sync state wiped");
        Ok(())
    }
}

impl Inner {
    pub(super) fn local_lock(&self, share_id: &ShareId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.local_locks)
            .entry(share_id.clone())
            .or_default()
            .clone()
    }

    pub(super) fn set_phase(&self, share_id: &ShareId, phase: SyncPhase) {
        let changed = match lock(&self.slots).get_mut(share_id) {
            Some(slot) if slot.state.phase() != phase => slot.state.transition(phase),
            _ => false,
        };
        if changed {
            self.events.publish(SyncEvent::PhaseChanged {
                share_id: share_id.clone(),
                phase,
            });
        }
    }

    fn skip(&self, share_id: Option<&ShareId>, reason: SkipReason) {
        debug!(share_id = ?share_id, ?reason, "Skipping sync");
        self.events.publish(SyncEvent::PassSkipped {
            share_id: share_id.cloned(),
            reason,
        });
    }

    fn blocked_reason(&self) -> Option<SkipReason> {
        let connectivity = *self.connectivity.borrow();
        if !connectivity.online {
            Some(SkipReason::Offline)
        } else if !connectivity.foreground {
            Some(SkipReason::Backgrounded)
        } else if self.session.state() == SessionState::Invalidated {
            Some(SkipReason::SessionInvalidated)
        } else {
            None
        }
    }

    fn known_shares(&self) -> Vec<ShareId> {
        let mut shares: Vec<ShareId> = lock(&self.slots).keys().cloned().collect();
        shares.sort();
        shares
    }

    async fn run_loop(self: Arc<Self>) {
        info!("Sync loop started");
        self.events.publish(SyncEvent::LoopStarted);
        let mut connectivity = self.connectivity.clone();
        let mut session = self.session.subscribe();
        loop {
            if let Err(e) = self.sync_all(false).await {
                warn!(error = %e, "Scheduled sync failed");
            }
            let interval = self.config.next_interval();
            debug!(?interval, "Next sync scheduled");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                Ok(()) = connectivity.changed() => {
                    debug!("Connectivity changed");
                }
                Ok(()) = session.changed() => {
                    let state = *session.borrow_and_update();
                    if state == SessionState::Invalidated {
                        info!("Session invalidated; cancelling in-flight passes");
                        self.cancel_passes();
                    }
                }
            }
        }
    }

    pub(super) async fn sync_all(self: &Arc<Self>, force: bool) -> Result<Vec<(ShareId, PassResult)>> {
        if let Some(reason) = self.blocked_reason() {
            self.skip(None, reason);
            return Ok(Vec::new());
        }
        let shares = self.refresh_shares().await?;
        let tickets: Vec<_> = shares
            .into_iter()
            .map(|share_id| {
                let ticket = self.request_pass(&share_id, force);
                (share_id, ticket)
            })
            .collect();
        let mut results = Vec::with_capacity(tickets.len());
        for (share_id, ticket) in tickets {
            results.push((share_id, ticket.wait().await));
        }
        Ok(results)
    }

    /// Mirror the remote share list locally. Returns the listed share ids.
    async fn refresh_shares(&self) -> Result<Vec<ShareId>> {
        let listed = self.remote.list_shares().await?;
        let local: HashSet<ShareId> = self
            .cache
            .shares()
            .await?
            .into_iter()
            .map(|share| share.share_id)
            .collect();
        let remote_ids: HashSet<ShareId> = listed.iter().map(|s| s.share_id.clone()).collect();

        let mut removed: Vec<ShareId> = local.difference(&remote_ids).cloned().collect();
        removed.sort();
        for share_id in &removed {
            info!(share_id = %share_id, "Share no longer listed; removing local copy");
            self.evict_share(share_id).await?;
        }

        let mut added = Vec::new();
        for share in &listed {
            if !local.contains(&share.share_id) {
                added.push(share.share_id.clone());
            }
            self.cache.put_share(share).await?;
        }
        added.sort();

        if !added.is_empty() || !removed.is_empty() {
            info!(added = added.len(), removed = removed.len(), "Share list changed");
            self.events.publish(SyncEvent::SharesChanged { added, removed });
        }
        let mut ids: Vec<ShareId> = remote_ids.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    fn request_pass(self: &Arc<Self>, share_id: &ShareId, force: bool) -> Ticket {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(share_id.clone()).or_insert_with(ShareSlot::new);

        if !slot.state.refresh(Instant::now()) {
            if !force {
                drop(slots);
                self.skip(Some(share_id), SkipReason::BackOff);
                return Ticket::Ready(PassResult::Skipped(SkipReason::BackOff));
            }
            slot.state.force_idle();
        }

        let completed = slot.progress.borrow().completed;
        let target = if slot.running {
            debug!(share_id = %share_id, "Pass in flight; coalescing request");
            slot.rerun = true;
            completed + 2
        } else {
            slot.running = true;
            let previous = slot.stale_driver.take();
            let inner = self.clone();
            let share = share_id.clone();
            let epoch = slot.epoch;
            slot.driver = Some(tokio::spawn(async move {
                inner.drive(share, epoch, previous).await
            }));
            completed + 1
        };
        Ticket::Waiting {
            progress: slot.progress.subscribe(),
            target,
            epoch: slot.epoch,
        }
    }

    async fn drive(self: Arc<Self>, share_id: ShareId, epoch: u64, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        loop {
            let outcome = match self.permits.acquire().await {
                Ok(_permit) => self.run_pass(&share_id).await,
                Err(_) => return,
            };

            let mut slots = lock(&self.slots);
            let Some(slot) = slots.get_mut(&share_id) else {
                return;
            };
            if slot.epoch != epoch {
                return;
            }
            let result = self.finish_pass(&share_id, &mut slot.state, outcome);
            slot.progress.send_modify(|progress| {
                progress.completed += 1;
                progress.last = Some(result);
            });
            if slot.rerun {
                slot.rerun = false;
                continue;
            }
            slot.running = false;
            slot.driver = None;
            return;
        }
    }

    fn finish_pass(
        &self,
        share_id: &ShareId,
        state: &mut ShareSyncState,
        outcome: Result<PassSummary>,
    ) -> PassResult {
        match outcome {
            Ok(mut summary) => {
                state.succeed();
                summary.changed.sort();
                summary.changed.dedup();
                let changed = summary.changed.len();
                info!(
                    share_id = %share_id,
                    changed,
                    conflicts = summary.conflicts.len(),
                    rejected = summary.rejected.len(),
                    "Sync pass finished"
                );
                self.events.publish(SyncEvent::PhaseChanged {
                    share_id: share_id.clone(),
                    phase: SyncPhase::Idle,
                });
                if changed > 0 {
                    self.events.publish(SyncEvent::ItemsUpdated {
                        share_id: share_id.clone(),
                        item_ids: summary.changed,
                    });
                }
                self.events.publish(SyncEvent::PassFinished {
                    share_id: share_id.clone(),
                    changed,
                });
                PassResult::Synced {
                    changed,
                    conflicts: summary.conflicts,
                    rejected: summary.rejected,
                }
            }
            Err(VaultSyncError::Cancelled) => {
                debug!(share_id = %share_id, "Sync pass cancelled");
                state.force_idle();
                PassResult::Cancelled
            }
            Err(e) => {
                let message = e.to_string();
                error!(share_id = %share_id, error = %message, transient = e.is_transient(), "Sync pass failed");
                state.fail(message.clone(), Instant::now());
                self.events.publish(SyncEvent::PhaseChanged {
                    share_id: share_id.clone(),
                    phase: SyncPhase::Error,
                });
                self.events.publish(SyncEvent::PassFailed {
                    share_id: share_id.clone(),
                    error: message.clone(),
                });
                PassResult::Failed(message)
            }
        }
    }

    async fn evict_share(&self, share_id: &ShareId) -> Result<()> {
        let slot = lock(&self.slots).remove(share_id);
        if let Some(mut slot) = slot {
            slot.cancel();
            if let Some(driver) = slot.stale_driver.take() {
                let _ = driver.await;
            }
        }
        let local = self.local_lock(share_id);
        let _guard = local.lock().await;
        self.cache.remove_share(share_id).await?;
        self.keys.forget(share_id);
        debug!(share_id = %share_id, "Evicted share");
        Ok(())
    }

    fn cancel_passes(&self) {
        for slot in lock(&self.slots).values_mut() {
            slot.cancel();
        }
    }

    /// Wait for aborted drivers to finish, then drop all per-share state.
    pub(super) async fn wind_down(&self) {
        let stale: Vec<JoinHandle<()>> = lock(&self.slots)
            .drain()
            .filter_map(|(_, mut slot)| slot.stale_driver.take())
            .collect();
        for driver in stale {
            let _ = driver.await;
        }
    }
}
