//! Local item changes. Each change is applied to the cache optimistically
//! and queued for the next pass to push.

use crate::codec::ItemContent;
use crate::models::{
    ItemId, ItemRevision, ItemState, MutationKind, PendingMutation, ShareId,
};
use crate::remote::RemoteError;
use crate::sync::conflict::ConflictChoice;
use crate::sync::events::SyncEvent;
use crate::sync::reconciler::SyncReconciler;
use crate::{Result, VaultSyncError};
use chrono::Utc;
use std::fmt;
use tracing::{debug, info, warn};

/// A cached item with its content opened.
#[derive(Clone, PartialEq)]
pub struct DecryptedItem {
    pub share_id: ShareId,
    pub revision: ItemRevision,
    /// True while a local change awaits push.
    pub pending: bool,
    pub content: ItemContent,
}

impl fmt::Debug for DecryptedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedItem")
            .field("share_id", &self.share_id)
            .field("item_id", &self.revision.item_id)
            .field("revision", &self.revision.revision)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

fn not_found(share_id: &ShareId, item_id: &ItemId) -> VaultSyncError {
    VaultSyncError::NotFound(format!("item {} in share {}", item_id, share_id))
}

impl SyncReconciler {
    /// Encrypt `content` with the active keys and queue its creation.
    pub async fn create_item(&self, share_id: &ShareId, content: &ItemContent) -> Result<ItemId> {
        let inner = &self.inner;
        let keys = inner.keys.active_keys(share_id).await?;
        let encrypted = inner.cache.codec().encrypt(content, &keys)?;
        let item_id = ItemId::generate();
        let now = Utc::now().timestamp();
        let revision = ItemRevision {
            item_id: item_id.clone(),
            revision: 0,
            content_format_version: encrypted.content_format_version,
            key_rotation: encrypted.key_rotation,
            content: encrypted.content.clone(),
            state: ItemState::Active,
            create_time: now,
            modify_time: now,
            last_use_time: None,
            revision_time: now,
        };
        let kind = MutationKind::Create {
            key_rotation: encrypted.key_rotation,
            content_format_version: encrypted.content_format_version,
            content: encrypted.content,
        };
        {
            let lock = inner.local_lock(share_id);
            let _guard = lock.lock().await;
            let mut changes = inner.cache.changes(share_id);
            changes.put(&[revision], true).await?;
            changes.enqueue(&item_id, 0, &kind).await?;
            changes.commit().await?;
        }
        info!(share_id = %share_id, item_id = %item_id, "Created item locally");
        self.local_change(share_id, vec![item_id.clone()]);
        Ok(item_id)
    }

    /// Replace the content of an item. Content is always re-encrypted with
    /// the active rotation.
    pub async fn update_item(&self, share_id: &ShareId, item_id: &ItemId, content: &ItemContent) -> Result<()> {
        let inner = &self.inner;
        let keys = inner.keys.active_keys(share_id).await?;
        let encrypted = inner.cache.codec().encrypt(content, &keys)?;
        let fields = (
            encrypted.key_rotation,
            encrypted.content_format_version,
            encrypted.content.clone(),
        );

        let lock = inner.local_lock(share_id);
        let _guard = lock.lock().await;
        let cached = inner
            .cache
            .revision(share_id, item_id)
            .await?
            .ok_or_else(|| not_found(share_id, item_id))?;

        let queued = inner.cache.pending_mutations(share_id).await?;
        let mut changes = inner.cache.changes(share_id);
        let mergeable = queued.iter().rev().find(|m| {
            &m.item_id == item_id
                && !m.conflicted
                && matches!(m.kind, MutationKind::Create { .. } | MutationKind::Update { .. })
        });
        match mergeable {
            Some(existing) => {
                let mut merged = existing.clone();
                let (key_rotation, content_format_version, content) = fields;
                merged.kind = match existing.kind {
                    MutationKind::Create { .. } => MutationKind::Create {
                        key_rotation,
                        content_format_version,
                        content,
                    },
                    _ => MutationKind::Update {
                        key_rotation,
                        content_format_version,
                        content,
                    },
                };
                changes.update_mutation(&merged).await?;
                debug!(share_id = %share_id, item_id = %item_id, seq = merged.seq, "Merged edit into queued change");
            }
            None => {
                let (key_rotation, content_format_version, content) = fields;
                let kind = MutationKind::Update {
                    key_rotation,
                    content_format_version,
                    content,
                };
                changes.enqueue(item_id, cached.revision.revision, &kind).await?;
            }
        }

        let mut revision = cached.revision;
        revision.content = encrypted.content;
        revision.key_rotation = encrypted.key_rotation;
        revision.content_format_version = encrypted.content_format_version;
        revision.modify_time = Utc::now().timestamp();
        changes.put(&[revision], true).await?;
        changes.commit().await?;
        drop(_guard);

        self.local_change(share_id, vec![item_id.clone()]);
        Ok(())
    }

    pub async fn trash_items(&self, share_id: &ShareId, item_ids: &[ItemId]) -> Result<()> {
        self.change_state(share_id, item_ids, ItemState::Trashed, MutationKind::Trash)
            .await
    }

    pub async fn untrash_items(&self, share_id: &ShareId, item_ids: &[ItemId]) -> Result<()> {
        self.change_state(share_id, item_ids, ItemState::Active, MutationKind::Untrash)
            .await
    }

    /// Permanently delete items. An item whose creation was never pushed is
    /// dropped locally without contacting the server.
    pub async fn delete_items(&self, share_id: &ShareId, item_ids: &[ItemId]) -> Result<()> {
        let inner = &self.inner;
        let lock = inner.local_lock(share_id);
        let _guard = lock.lock().await;
        let queued = inner.cache.pending_mutations(share_id).await?;

        let mut changes = inner.cache.changes(share_id);
        let mut changed = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            let cached = inner
                .cache
                .revision(share_id, item_id)
                .await?
                .ok_or_else(|| not_found(share_id, item_id))?;
            let own: Vec<&PendingMutation> = queued.iter().filter(|m| &m.item_id == item_id).collect();
            if own.iter().any(|m| matches!(m.kind, MutationKind::Create { .. })) {
                let seqs: Vec<i64> = own.iter().map(|m| m.seq).collect();
                changes.complete(&seqs);
                debug!(share_id = %share_id, item_id = %item_id, "Dropped unpushed item");
            } else {
                changes
                    .enqueue(item_id, cached.revision.revision, &MutationKind::Delete)
                    .await?;
            }
            changes.remove(std::slice::from_ref(item_id));
            changed.push(item_id.clone());
        }
        changes.commit().await?;
        drop(_guard);

        self.local_change(share_id, changed);
        Ok(())
    }

    /// Record that an item was used. Never marks the item as locally edited.
    pub async fn record_last_use(&self, share_id: &ShareId, item_id: &ItemId, last_use_time: i64) -> Result<()> {
        let inner = &self.inner;
        let lock = inner.local_lock(share_id);
        let _guard = lock.lock().await;
        let cached = inner
            .cache
            .revision(share_id, item_id)
            .await?
            .ok_or_else(|| not_found(share_id, item_id))?;
        let mut changes = inner.cache.changes(share_id);
        changes.merge_last_use(&cached, last_use_time).await?;

        let kind = MutationKind::LastUse { last_use_time };
        let queued = inner.cache.pending_mutations(share_id).await?;
        let existing = queued
            .into_iter()
            .find(|m| &m.item_id == item_id && matches!(m.kind, MutationKind::LastUse { .. }));
        match existing {
            Some(mut existing) => {
                existing.kind = kind;
                changes.update_mutation(&existing).await?;
            }
            None => {
                changes.enqueue(item_id, cached.revision.revision, &kind).await?;
            }
        }
        changes.commit().await?;
        Ok(())
    }

    /// Cached item with its content decrypted, or `None` when it is not in
    /// the cache. A record that no longer opens is dropped and fetched again
    /// by the next pass.
    pub async fn item_content(&self, share_id: &ShareId, item_id: &ItemId) -> Result<Option<DecryptedItem>> {
        let Some(cached) = self.inner.cache.revision(share_id, item_id).await? else {
            return Ok(None);
        };
        let content = self.inner.open_revision(share_id, &cached.revision).await?;
        Ok(Some(DecryptedItem {
            share_id: share_id.clone(),
            revision: cached.revision,
            pending: cached.pending,
            content,
        }))
    }

    /// Every cached item of a share in `state`, decrypted. Items that fail to
    /// decrypt are logged and left out.
    pub async fn items(&self, share_id: &ShareId, state: Option<ItemState>) -> Result<Vec<DecryptedItem>> {
        let cached = self.inner.cache.revisions(share_id, state).await?;
        let mut items = Vec::with_capacity(cached.len());
        for entry in cached {
            match self.inner.open_revision(share_id, &entry.revision).await {
                Ok(content) => items.push(DecryptedItem {
                    share_id: share_id.clone(),
                    revision: entry.revision,
                    pending: entry.pending,
                    content,
                }),
                Err(VaultSyncError::Crypto(e)) => {
                    warn!(share_id = %share_id, item_id = %entry.revision.item_id, error = %e, "Cached item does not decrypt");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    /// Queued changes of a share, oldest first.
    pub async fn pending_changes(&self, share_id: &ShareId) -> Result<Vec<PendingMutation>> {
        self.inner.cache.pending_mutations(share_id).await
    }

    /// Settle a conflict held under the manual policy.
    pub async fn resolve_conflict(&self, share_id: &ShareId, item_id: &ItemId, choice: ConflictChoice) -> Result<()> {
        let inner = &self.inner;
        let latest = match inner.remote.get_item(share_id, item_id).await {
            Ok(item) => Some(item),
            Err(RemoteError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let lock = inner.local_lock(share_id);
        let _guard = lock.lock().await;
        let own: Vec<PendingMutation> = inner
            .cache
            .pending_mutations(share_id)
            .await?
            .into_iter()
            .filter(|m| &m.item_id == item_id)
            .collect();
        if !own.iter().any(|m| m.conflicted) {
            return Err(VaultSyncError::NotFound(format!(
                "no held conflict for item {} in share {}",
                item_id, share_id
            )));
        }

        let mut changes = inner.cache.changes(share_id);
        match choice {
            ConflictChoice::KeepLocal => {
                let base = latest.as_ref().map_or(0, |item| item.revision);
                for mut mutation in own {
                    mutation.conflicted = false;
                    mutation.base_revision = base;
                    changes.update_mutation(&mutation).await?;
                }
            }
            ConflictChoice::KeepRemote => {
                let seqs: Vec<i64> = own.iter().map(|m| m.seq).collect();
                changes.complete(&seqs);
                match latest {
                    Some(item) => changes.put(&[item], false).await?,
                    None => changes.remove(std::slice::from_ref(item_id)),
                }
            }
        }
        changes.commit().await?;
        drop(_guard);

        info!(share_id = %share_id, item_id = %item_id, ?choice, "Resolved held conflict");
        self.local_change(share_id, vec![item_id.clone()]);
        Ok(())
    }

    async fn change_state(
        &self,
        share_id: &ShareId,
        item_ids: &[ItemId],
        target: ItemState,
        kind: MutationKind,
    ) -> Result<()> {
        let inner = &self.inner;
        let lock = inner.local_lock(share_id);
        let _guard = lock.lock().await;

        let mut changes = inner.cache.changes(share_id);
        let mut changed = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            let cached = inner
                .cache
                .revision(share_id, item_id)
                .await?
                .ok_or_else(|| not_found(share_id, item_id))?;
            if cached.revision.state == target {
                continue;
            }
            let base = cached.revision.revision;
            let mut revision = cached.revision;
            revision.state = target;
            revision.modify_time = Utc::now().timestamp();
            changes.put(&[revision], true).await?;
            changes.enqueue(item_id, base, &kind).await?;
            changed.push(item_id.clone());
        }
        changes.commit().await?;
        drop(_guard);

        if !changed.is_empty() {
            debug!(share_id = %share_id, count = changed.len(), kind = kind.label(), "Changed item state locally");
            self.local_change(share_id, changed);
        }
        Ok(())
    }

    fn local_change(&self, share_id: &ShareId, item_ids: Vec<ItemId>) {
        if item_ids.is_empty() {
            return;
        }
        self.inner.events.publish(SyncEvent::ItemsUpdated {
            share_id: share_id.clone(),
            item_ids,
        });
    }
}
