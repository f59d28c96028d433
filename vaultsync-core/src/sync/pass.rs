//! One sync pass of a share: paged pull, removals, then the outbox push.

use crate::cache::CacheChanges;
use crate::codec::ItemContent;
use crate::config::ConflictPolicy;
use crate::crypto::CryptoError;
use crate::models::{
    CreateItemRequest, ItemId, ItemRevision, ItemRevisionRef, ModifiedItem, MutationKind,
    PartialListing, PendingMutation, ShareId, UpdateItemRequest,
};
use crate::remote::{PushOperation, PushOutcome, RemoteError};
use crate::sync::conflict::{ConflictReport, ConflictResolver, RejectedChange, Resolution};
use crate::sync::diff;
use crate::sync::events::SyncEvent;
use crate::sync::reconciler::{Inner, PassSummary};
use crate::sync::state::SyncPhase;
use crate::{Result, VaultSyncError};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Bookkeeping of one outbox push.
#[derive(Default)]
struct PushState {
    /// Items whose remaining mutations must wait for a later pass.
    skip: HashSet<ItemId>,
    /// Base revisions moved forward by pushes made earlier in this pass.
    bases: HashMap<ItemId, i64>,
    changed: Vec<ItemId>,
    conflicts: Vec<ConflictReport>,
    rejected: Vec<RejectedChange>,
}

impl PushState {
    fn base_of(&self, mutation: &PendingMutation) -> i64 {
        self.bases
            .get(&mutation.item_id)
            .copied()
            .unwrap_or(mutation.base_revision)
    }
}

/// Errors that concern a single item rather than the share.
fn is_item_level(error: &CryptoError) -> bool {
    matches!(
        error,
        CryptoError::FailedToDecryptContent
            | CryptoError::UnmatchedKeyRotation { .. }
            | CryptoError::UnsupportedContentFormat(_)
            | CryptoError::InvalidEncoding(_)
            | CryptoError::InvalidKeyLength { .. }
    )
}

fn is_batchable(kind: &MutationKind) -> bool {
    matches!(
        kind,
        MutationKind::Trash | MutationKind::Untrash | MutationKind::Delete
    )
}

/// Items with a queued change that should not be overwritten by the listing.
fn queued_items(mutations: &[PendingMutation]) -> HashSet<ItemId> {
    mutations
        .iter()
        .filter(|m| !matches!(m.kind, MutationKind::LastUse { .. }))
        .map(|m| m.item_id.clone())
        .collect()
}

fn operation(mutation: &PendingMutation, base: i64) -> PushOperation {
    let reference = || {
        vec![ItemRevisionRef {
            item_id: mutation.item_id.clone(),
            revision: base,
        }]
    };
    match &mutation.kind {
        MutationKind::Create {
            key_rotation,
            content_format_version,
            content,
        } => PushOperation::Create(CreateItemRequest {
            item_id: mutation.item_id.clone(),
            key_rotation: *key_rotation,
            content_format_version: *content_format_version,
            content: content.clone(),
        }),
        MutationKind::Update {
            key_rotation,
            content_format_version,
            content,
        } => PushOperation::Update {
            item_id: mutation.item_id.clone(),
            request: UpdateItemRequest {
                key_rotation: *key_rotation,
                last_revision: base,
                content_format_version: *content_format_version,
                content: content.clone(),
            },
        },
        MutationKind::Trash => PushOperation::Trash(reference()),
        MutationKind::Untrash => PushOperation::Untrash(reference()),
        MutationKind::Delete => PushOperation::Delete(reference()),
        MutationKind::LastUse { last_use_time } => PushOperation::LastUse {
            item_id: mutation.item_id.clone(),
            last_use_time: *last_use_time,
        },
    }
}

/// The operation replayed on top of `remote_revision`. A creation that
/// collided with an existing item becomes an update of it.
fn rebased_operation(mutation: &PendingMutation, remote_revision: i64) -> PushOperation {
    match &mutation.kind {
        MutationKind::Create {
            key_rotation,
            content_format_version,
            content,
        } => PushOperation::Update {
            item_id: mutation.item_id.clone(),
            request: UpdateItemRequest {
                key_rotation: *key_rotation,
                last_revision: remote_revision,
                content_format_version: *content_format_version,
                content: content.clone(),
            },
        },
        _ => operation(mutation, remote_revision),
    }
}

fn batch_operation(kind: &MutationKind, refs: Vec<ItemRevisionRef>) -> PushOperation {
    match kind {
        MutationKind::Untrash => PushOperation::Untrash(refs),
        MutationKind::Delete => PushOperation::Delete(refs),
        _ => PushOperation::Trash(refs),
    }
}

impl Inner {
    pub(super) async fn run_pass(&self, share_id: &ShareId) -> Result<PassSummary> {
        info!(share_id = %share_id, "Starting sync pass");
        self.events.publish(SyncEvent::PassStarted {
            share_id: share_id.clone(),
        });
        self.set_phase(share_id, SyncPhase::Fetching);

        let share = self
            .cache
            .shares()
            .await?
            .into_iter()
            .find(|share| &share.share_id == share_id);
        if let Some(share) = share {
            self.keys.ensure_rotation(share_id, share.key_rotation).await?;
        }

        self.repair_pending(share_id).await?;
        let mut summary = PassSummary::default();
        self.pull(share_id, &mut summary).await?;
        self.push_outbox(share_id, &mut summary).await?;
        Ok(summary)
    }

    /// Decrypt a revision with the keys of its rotation.
    pub(super) async fn open_revision(&self, share_id: &ShareId, item: &ItemRevision) -> Result<ItemContent> {
        let keys = self.keys.keys_for_rotation(share_id, item.key_rotation).await?;
        self.cache.codec().decrypt_item(item, &keys)
    }

    /// Clear the pending flag of records that no queued change describes,
    /// so the listing can update them again.
    async fn repair_pending(&self, share_id: &ShareId) -> Result<()> {
        let lock = self.local_lock(share_id);
        let _guard = lock.lock().await;
        let queued = queued_items(&self.cache.pending_mutations(share_id).await?);
        let stranded: Vec<ItemId> = self
            .cache
            .records(share_id)
            .await?
            .into_iter()
            .filter(|record| record.pending && !queued.contains(&record.item_id))
            .map(|record| record.item_id)
            .collect();
        if stranded.is_empty() {
            return Ok(());
        }
        warn!(share_id = %share_id, count = stranded.len(), "Clearing pending flag of items with no queued change");
        let mut changes = self.cache.changes(share_id);
        changes.clear_pending(&stranded);
        changes.commit().await?;
        Ok(())
    }

    async fn pull(&self, share_id: &ShareId, summary: &mut PassSummary) -> Result<()> {
        let mut cursor = self.cache.cursor(share_id).await?;
        let mut listing = match cursor.in_progress.take() {
            Some(partial) => {
                info!(share_id = %share_id, next_page = partial.next_page, "Resuming interrupted listing");
                partial
            }
            None => PartialListing::default(),
        };
        let page_size = self.remote.page_size() as usize;

        loop {
            self.set_phase(share_id, SyncPhase::Fetching);
            let page = self.remote.fetch_page(share_id, listing.next_page).await?;
            let last = page.len() < page_size;
            for item in &page {
                listing.seen.insert(item.item_id.clone(), item.revision);
            }

            self.set_phase(share_id, SyncPhase::Diffing);
            let local = diff::index_records(self.cache.records(share_id).await?);
            let plan = diff::plan_page(page, &local);
            if !plan.held.is_empty() {
                debug!(share_id = %share_id, held = plan.held.len(), "Keeping items with local changes");
            }

            self.set_phase(share_id, SyncPhase::Applying);
            let accepted = self.validate(share_id, plan.accepted).await?;
            summary.changed.extend(self.apply_page(share_id, accepted).await?);

            listing.next_page += 1;
            if last {
                break;
            }
            cursor.in_progress = Some(listing.clone());
            self.cache.save_cursor(&cursor).await?;
        }

        self.set_phase(share_id, SyncPhase::Diffing);
        let local = diff::index_records(self.cache.records(share_id).await?);
        let removals = diff::plan_removals(&listing.seen, &local);

        self.set_phase(share_id, SyncPhase::Applying);
        if !removals.is_empty() {
            let lock = self.local_lock(share_id);
            let _guard = lock.lock().await;
            let queued = queued_items(&self.cache.pending_mutations(share_id).await?);
            let removals: Vec<ItemId> = removals
                .into_iter()
                .filter(|item_id| !queued.contains(item_id))
                .collect();
            self.cache.remove(share_id, &removals).await?;
            info!(share_id = %share_id, count = removals.len(), "Removed items no longer on the server");
            summary.changed.extend(removals);
        }

        cursor.known_revisions = listing.seen;
        cursor.in_progress = None;
        cursor.last_synced_at = Some(Utc::now());
        self.cache.save_cursor(&cursor).await
    }

    /// Keep the revisions that decrypt; report the others.
    async fn validate(&self, share_id: &ShareId, candidates: Vec<ItemRevision>) -> Result<Vec<ItemRevision>> {
        let mut valid = Vec::with_capacity(candidates.len());
        for item in candidates {
            match self.open_revision(share_id, &item).await {
                Ok(_) => valid.push(item),
                Err(VaultSyncError::Crypto(e)) if is_item_level(&e) => {
                    warn!(share_id = %share_id, item_id = %item.item_id, error = %e, "Skipping item that does not decrypt");
                    self.events.publish(SyncEvent::ItemUnavailable {
                        share_id: share_id.clone(),
                        item_id: item.item_id.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(valid)
    }

    /// Cache accepted revisions, re-checking against local edits made while
    /// the page was in flight.
    async fn apply_page(&self, share_id: &ShareId, accepted: Vec<ItemRevision>) -> Result<Vec<ItemId>> {
        if accepted.is_empty() {
            return Ok(Vec::new());
        }
        let lock = self.local_lock(share_id);
        let _guard = lock.lock().await;
        let local = diff::index_records(self.cache.records(share_id).await?);
        let queued = queued_items(&self.cache.pending_mutations(share_id).await?);

        let fresh: Vec<ItemRevision> = accepted
            .into_iter()
            .filter(|item| !queued.contains(&item.item_id))
            .filter(|item| match local.get(&item.item_id) {
                None => true,
                Some(cached) => {
                    ConflictResolver::resolve(cached.revision, cached.pending, item)
                        == Resolution::AcceptRemote
                }
            })
            .collect();
        self.cache.put(share_id, &fresh, false).await?;
        Ok(fresh.into_iter().map(|item| item.item_id).collect())
    }

    async fn push_outbox(&self, share_id: &ShareId, summary: &mut PassSummary) -> Result<()> {
        let queued = self.cache.pending_mutations(share_id).await?;
        if queued.is_empty() {
            return Ok(());
        }
        info!(share_id = %share_id, count = queued.len(), "Pushing local changes");

        let mut state = PushState::default();
        let mut batch: Vec<PendingMutation> = Vec::new();
        for mutation in queued {
            if mutation.conflicted || state.skip.contains(&mutation.item_id) {
                state.skip.insert(mutation.item_id.clone());
                continue;
            }
            if is_batchable(&mutation.kind) {
                let flush = batch.first().is_some_and(|first| first.kind != mutation.kind)
                    || batch.iter().any(|m| m.item_id == mutation.item_id)
                    || batch.len() >= self.config.batch_size.max(1);
                if flush {
                    self.push_batch(share_id, std::mem::take(&mut batch), &mut state).await?;
                }
                batch.push(mutation);
                continue;
            }
            if !batch.is_empty() {
                self.push_batch(share_id, std::mem::take(&mut batch), &mut state).await?;
            }
            if state.skip.contains(&mutation.item_id) {
                continue;
            }
            self.push_one(share_id, mutation, &mut state).await?;
        }
        if !batch.is_empty() {
            self.push_batch(share_id, batch, &mut state).await?;
        }

        summary.changed.extend(state.changed);
        summary.conflicts.extend(state.conflicts);
        summary.rejected.extend(state.rejected);
        Ok(())
    }

    async fn push_batch(
        &self,
        share_id: &ShareId,
        batch: Vec<PendingMutation>,
        state: &mut PushState,
    ) -> Result<()> {
        let batch: Vec<PendingMutation> = batch
            .into_iter()
            .filter(|m| !state.skip.contains(&m.item_id))
            .collect();
        if batch.len() <= 1 {
            for mutation in batch {
                self.push_one(share_id, mutation, state).await?;
            }
            return Ok(());
        }

        let refs = batch
            .iter()
            .map(|m| ItemRevisionRef {
                item_id: m.item_id.clone(),
                revision: state.base_of(m),
            })
            .collect();
        let op = batch_operation(&batch[0].kind, refs);
        match self.remote.push(share_id, &op).await {
            Ok(outcome) => self.settle(share_id, &batch, outcome, state).await,
            Err(RemoteError::Conflict(_) | RemoteError::NotFound(_) | RemoteError::Rejected { .. }) => {
                debug!(share_id = %share_id, count = batch.len(), "Batch refused; pushing items one by one");
                for mutation in batch {
                    if !state.skip.contains(&mutation.item_id) {
                        self.push_one(share_id, mutation, state).await?;
                    }
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn push_one(&self, share_id: &ShareId, mutation: PendingMutation, state: &mut PushState) -> Result<()> {
        let base = state.base_of(&mutation);
        let op = operation(&mutation, base);
        match self.remote.push(share_id, &op).await {
            Ok(outcome) => self.settle(share_id, &[mutation], outcome, state).await,
            Err(RemoteError::Conflict(reason)) => {
                debug!(share_id = %share_id, item_id = %mutation.item_id, %reason, "Push conflicted; rebasing");
                self.rebase_and_retry(share_id, mutation, base, state).await
            }
            Err(RemoteError::NotFound(reason)) => self.orphaned(share_id, &mutation, reason, state).await,
            Err(e @ RemoteError::Rejected { .. }) => self.hold_rejected(share_id, mutation, e.to_string(), state).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Replay a conflicted mutation once on top of the current remote revision.
    async fn rebase_and_retry(
        &self,
        share_id: &ShareId,
        mutation: PendingMutation,
        base: i64,
        state: &mut PushState,
    ) -> Result<()> {
        let remote_now = match self.remote.get_item(share_id, &mutation.item_id).await {
            Ok(item) => item,
            Err(RemoteError::NotFound(reason)) => return self.orphaned(share_id, &mutation, reason, state).await,
            Err(e) => return Err(e.into()),
        };
        let op = rebased_operation(&mutation, remote_now.revision);
        match self.remote.push(share_id, &op).await {
            Ok(outcome) => {
                debug!(share_id = %share_id, item_id = %mutation.item_id, revision = remote_now.revision, "Rebased push accepted");
                self.settle(share_id, &[mutation], outcome, state).await
            }
            Err(RemoteError::Conflict(_)) => self.persistent_conflict(share_id, mutation, base, state).await,
            Err(RemoteError::NotFound(reason)) => self.orphaned(share_id, &mutation, reason, state).await,
            Err(e @ RemoteError::Rejected { .. }) => self.hold_rejected(share_id, mutation, e.to_string(), state).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn persistent_conflict(
        &self,
        share_id: &ShareId,
        mut mutation: PendingMutation,
        base: i64,
        state: &mut PushState,
    ) -> Result<()> {
        let latest = match self.remote.get_item(share_id, &mutation.item_id).await {
            Ok(item) => Some(item),
            Err(RemoteError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let held = self.config.conflict_policy == ConflictPolicy::Manual;
        let report = ConflictReport {
            share_id: share_id.clone(),
            item_id: mutation.item_id.clone(),
            base_revision: base,
            remote_revision: latest.as_ref().map_or(0, |item| item.revision),
            held,
        };
        warn!(
            share_id = %share_id,
            item_id = %report.item_id,
            base_revision = report.base_revision,
            remote_revision = report.remote_revision,
            held,
            "Revision conflict persisted after rebase"
        );

        if held {
            mutation.conflicted = true;
            self.cache.update_mutation(&mutation).await?;
            state.skip.insert(mutation.item_id.clone());
        } else {
            self.discard_with(share_id, &mutation.item_id, latest, state).await?;
        }
        self.events.publish(SyncEvent::RevisionConflict(report.clone()));
        state.conflicts.push(report);
        Ok(())
    }

    /// The item of a queued change is gone from the server: drop the change
    /// and the local copy, and report it.
    async fn orphaned(
        &self,
        share_id: &ShareId,
        mutation: &PendingMutation,
        reason: String,
        state: &mut PushState,
    ) -> Result<()> {
        info!(share_id = %share_id, item_id = %mutation.item_id, "Item gone from the server; dropping local change");
        self.discard_with(share_id, &mutation.item_id, None, state).await?;
        self.report_rejected(share_id, mutation, reason, false, state);
        Ok(())
    }

    /// Keep a change the server refused queued but out of pushes, with the
    /// local copy intact, until it is resolved.
    async fn hold_rejected(
        &self,
        share_id: &ShareId,
        mut mutation: PendingMutation,
        reason: String,
        state: &mut PushState,
    ) -> Result<()> {
        warn!(share_id = %share_id, item_id = %mutation.item_id, %reason, "Server rejected local change; holding it");
        mutation.conflicted = true;
        self.cache.update_mutation(&mutation).await?;
        state.skip.insert(mutation.item_id.clone());
        self.report_rejected(share_id, &mutation, reason, true, state);
        Ok(())
    }

    fn report_rejected(
        &self,
        share_id: &ShareId,
        mutation: &PendingMutation,
        reason: String,
        held: bool,
        state: &mut PushState,
    ) {
        let rejected = RejectedChange {
            share_id: share_id.clone(),
            item_id: mutation.item_id.clone(),
            change: mutation.kind.label().to_string(),
            reason,
            held,
        };
        self.events.publish(SyncEvent::ChangeRejected(rejected.clone()));
        state.rejected.push(rejected);
    }

    /// Drop every queued change of an item and cache `latest` in its place.
    async fn discard_with(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        latest: Option<ItemRevision>,
        state: &mut PushState,
    ) -> Result<()> {
        let latest = match latest {
            Some(item) => self.validate(share_id, vec![item]).await?.pop(),
            None => None,
        };
        let lock = self.local_lock(share_id);
        let _guard = lock.lock().await;
        let seqs: Vec<i64> = self
            .cache
            .pending_mutations(share_id)
            .await?
            .into_iter()
            .filter(|m| &m.item_id == item_id)
            .map(|m| m.seq)
            .collect();
        let mut changes = self.cache.changes(share_id);
        changes.complete(&seqs);
        match latest {
            Some(item) => changes.put(&[item], false).await?,
            None => changes.remove(std::slice::from_ref(item_id)),
        }
        changes.commit().await?;
        state.skip.insert(item_id.clone());
        state.changed.push(item_id.clone());
        Ok(())
    }

    /// Record a push the server accepted. The outbox and the cached records
    /// are updated in one commit.
    async fn settle(
        &self,
        share_id: &ShareId,
        pushed: &[PendingMutation],
        outcome: PushOutcome,
        state: &mut PushState,
    ) -> Result<()> {
        let lock = self.local_lock(share_id);
        let _guard = lock.lock().await;
        let queued = self.cache.pending_mutations(share_id).await?;

        // a pushed change edited locally while in flight stays queued
        let done: HashSet<i64> = pushed
            .iter()
            .filter(|m| {
                queued
                    .iter()
                    .find(|current| current.seq == m.seq)
                    .map_or(true, |current| current.kind == m.kind)
            })
            .map(|m| m.seq)
            .collect();
        let remaining: Vec<PendingMutation> = queued
            .into_iter()
            .filter(|m| !done.contains(&m.seq))
            .collect();
        let still_queued = queued_items(&remaining);

        let mut changes = self.cache.changes(share_id);
        changes.complete(&done.iter().copied().collect::<Vec<_>>());
        let mut changed = Vec::new();
        match outcome {
            PushOutcome::Revision(revision) => {
                let item_id = revision.item_id.clone();
                rebase_remaining(&mut changes, &remaining, &item_id, revision.revision, state).await?;
                if !still_queued.contains(&item_id) {
                    changes.put(&[revision], false).await?;
                }
                changed.push(item_id);
            }
            PushOutcome::Modified(modified) => {
                for change in &modified {
                    rebase_remaining(&mut changes, &remaining, &change.item_id, change.revision, state)
                        .await?;
                }
                let settled: Vec<ModifiedItem> = modified
                    .into_iter()
                    .filter(|change| !still_queued.contains(&change.item_id))
                    .collect();
                let revisions = self.cache.modified_revisions(share_id, &settled).await?;
                changes.put(&revisions, false).await?;
                changed.extend(pushed.iter().map(|m| m.item_id.clone()));
            }
            PushOutcome::Deleted(item_ids) => {
                let orphaned: Vec<i64> = remaining
                    .iter()
                    .filter(|m| item_ids.contains(&m.item_id))
                    .map(|m| m.seq)
                    .collect();
                changes.complete(&orphaned);
                changes.remove(&item_ids);
                state.skip.extend(item_ids.iter().cloned());
                changed.extend(item_ids);
            }
            PushOutcome::LastUseRecorded => {}
        }
        changes.commit().await?;
        state.changed.extend(changed);
        Ok(())
    }
}

/// Move later queued changes of an item onto the revision just created. A
/// creation that is still queued after its push becomes an update.
async fn rebase_remaining(
    changes: &mut CacheChanges<'_>,
    remaining: &[PendingMutation],
    item_id: &ItemId,
    revision: i64,
    state: &mut PushState,
) -> Result<()> {
    state.bases.insert(item_id.clone(), revision);
    for mutation in remaining.iter().filter(|m| &m.item_id == item_id) {
        let created = matches!(mutation.kind, MutationKind::Create { .. });
        if mutation.base_revision == revision && !created {
            continue;
        }
        let mut rebased = mutation.clone();
        rebased.base_revision = revision;
        if let MutationKind::Create {
            key_rotation,
            content_format_version,
            content,
        } = &mutation.kind
        {
            rebased.kind = MutationKind::Update {
                key_rotation: *key_rotation,
                content_format_version: *content_format_version,
                content: content.clone(),
            };
        }
        changes.update_mutation(&rebased).await?;
    }
    Ok(())
}
