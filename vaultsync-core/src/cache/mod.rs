//! Local encrypted cache.
//!
//! [`LocalItemStore`] and [`SyncMetadataStore`] are the persistence seams;
//! they only ever see device-sealed records plus cleartext query metadata.
//! [`CacheStore`] joins them and commits a [`CacheWrite`] in one
//! transaction, so a record and the outbox entries describing it never
//! disagree. [`LocalCache`] sits on top and moves revisions through the
//! codec's local layer. A record that fails to unwrap is deleted and
//! reported absent, so the next pass refetches it from the server.

pub mod sqlite;

pub use sqlite::SqliteItemStore;

use crate::codec::ItemCryptoCodec;
use crate::models::{
    ItemId, ItemRevision, ItemState, LastUseItem, ModifiedItem, MutationKind, PendingMutation,
    Share, ShareId, SymmetricallyEncryptedItem, SyncCursor,
};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by cache backends
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cache task failed: {0}")]
    Task(String),

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// A queued mutation as persisted: the kind is device-sealed in `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMutation {
    pub seq: i64,
    pub share_id: ShareId,
    pub item_id: ItemId,
    pub base_revision: i64,
    pub payload: String,
    pub conflicted: bool,
    pub queued_at: i64,
}

/// Storage of device-sealed item records.
#[async_trait]
pub trait LocalItemStore: Send + Sync {
    async fn get(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
    ) -> std::result::Result<Option<SymmetricallyEncryptedItem>, CacheError>;

    /// Insert or replace records atomically.
    async fn upsert(&self, items: &[SymmetricallyEncryptedItem]) -> std::result::Result<(), CacheError>;

    async fn delete(&self, share_id: &ShareId, item_ids: &[ItemId]) -> std::result::Result<(), CacheError>;

    async fn query(
        &self,
        share_id: Option<&ShareId>,
        state: Option<ItemState>,
    ) -> std::result::Result<Vec<SymmetricallyEncryptedItem>, CacheError>;

    async fn delete_share(&self, share_id: &ShareId) -> std::result::Result<(), CacheError>;
}

/// Storage of sync bookkeeping: shares, cursors and the mutation outbox.
#[async_trait]
pub trait SyncMetadataStore: Send + Sync {
    async fn list_shares(&self) -> std::result::Result<Vec<Share>, CacheError>;
    async fn upsert_share(&self, share: &Share) -> std::result::Result<(), CacheError>;
    /// Removes the share together with its cursor and queued mutations.
    async fn delete_share_metadata(&self, share_id: &ShareId) -> std::result::Result<(), CacheError>;

    async fn load_cursor(&self, share_id: &ShareId) -> std::result::Result<Option<SyncCursor>, CacheError>;
    async fn save_cursor(&self, cursor: &SyncCursor) -> std::result::Result<(), CacheError>;
    async fn clear_cursors(&self) -> std::result::Result<(), CacheError>;

    async fn enqueue_mutation(&self, mutation: &StoredMutation) -> std::result::Result<i64, CacheError>;
    async fn queued_mutations(&self, share_id: &ShareId)
        -> std::result::Result<Vec<StoredMutation>, CacheError>;
    async fn update_mutation(&self, mutation: &StoredMutation) -> std::result::Result<(), CacheError>;
    async fn remove_mutations(&self, seqs: &[i64]) -> std::result::Result<(), CacheError>;

    /// Remove everything, for logout.
    async fn clear_all(&self) -> std::result::Result<(), CacheError>;
}

/// Record and outbox changes of one share, applied all or nothing.
#[derive(Debug, Clone)]
pub struct CacheWrite {
    pub share_id: ShareId,
    pub upsert: Vec<SymmetricallyEncryptedItem>,
    pub delete: Vec<ItemId>,
    /// Records whose pending flag is cleared without rewriting them.
    pub clear_pending: Vec<ItemId>,
    pub enqueue: Vec<StoredMutation>,
    pub update: Vec<StoredMutation>,
    /// Sequence numbers of mutations to drop from the outbox.
    pub complete: Vec<i64>,
}

impl CacheWrite {
    pub fn new(share_id: ShareId) -> Self {
        Self {
            share_id,
            upsert: Vec::new(),
            delete: Vec::new(),
            clear_pending: Vec::new(),
            enqueue: Vec::new(),
            update: Vec::new(),
            complete: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upsert.is_empty()
            && self.delete.is_empty()
            && self.clear_pending.is_empty()
            && self.enqueue.is_empty()
            && self.update.is_empty()
            && self.complete.is_empty()
    }
}

/// A backend holding both records and bookkeeping.
#[async_trait]
pub trait CacheStore: LocalItemStore + SyncMetadataStore {
    /// Apply `write` in one transaction: outbox removals, updates and
    /// insertions first, then record upserts, deletions and flag clears.
    /// Returns the sequence numbers assigned to `write.enqueue`, in order.
    async fn commit(&self, write: CacheWrite) -> std::result::Result<Vec<i64>, CacheError>;
}

/// A decrypted-at-the-local-layer cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRevision {
    pub revision: ItemRevision,
    pub pending: bool,
}

/// Typed access to the local cache.
#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn CacheStore>,
    codec: Arc<ItemCryptoCodec>,
}

impl LocalCache {
    pub fn new(store: Arc<dyn CacheStore>, codec: Arc<ItemCryptoCodec>) -> Self {
        Self { store, codec }
    }

    pub fn sqlite(store: Arc<SqliteItemStore>, codec: Arc<ItemCryptoCodec>) -> Self {
        Self::new(store, codec)
    }

    /// Start collecting changes to `share_id` for one atomic commit.
    pub fn changes(&self, share_id: &ShareId) -> CacheChanges<'_> {
        CacheChanges {
            cache: self,
            write: CacheWrite::new(share_id.clone()),
        }
    }

    pub fn codec(&self) -> &Arc<ItemCryptoCodec> {
        &self.codec
    }

    pub async fn revision(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
    ) -> Result<Option<CachedRevision>> {
        let Some(record) = self.store.get(share_id, item_id).await? else {
            return Ok(None);
        };
        self.unwrap_record(record).await
    }

    pub async fn revisions(
        &self,
        share_id: &ShareId,
        state: Option<ItemState>,
    ) -> Result<Vec<CachedRevision>> {
        let records = self.store.query(Some(share_id), state).await?;
        let mut revisions = Vec::with_capacity(records.len());
        for record in records {
            if let Some(cached) = self.unwrap_record(record).await? {
                revisions.push(cached);
            }
        }
        Ok(revisions)
    }

    /// Cleartext metadata of every record of a share, without unwrapping.
    pub async fn records(&self, share_id: &ShareId) -> Result<Vec<SymmetricallyEncryptedItem>> {
        Ok(self.store.query(Some(share_id), None).await?)
    }

    pub async fn put(&self, share_id: &ShareId, revisions: &[ItemRevision], pending: bool) -> Result<()> {
        let mut changes = self.changes(share_id);
        changes.put(revisions, pending).await?;
        changes.commit().await?;
        Ok(())
    }

    pub async fn remove(&self, share_id: &ShareId, item_ids: &[ItemId]) -> Result<()> {
        if item_ids.is_empty() {
            return Ok(());
        }
        self.store.delete(share_id, item_ids).await?;
        Ok(())
    }

    /// Merge server acknowledgements of state changes into cached revisions.
    pub async fn apply_modified(&self, share_id: &ShareId, modified: &[ModifiedItem]) -> Result<()> {
        let updated = self.modified_revisions(share_id, modified).await?;
        self.put(share_id, &updated, false).await
    }

    /// Cached revisions with server acknowledgements applied, not yet written.
    pub async fn modified_revisions(
        &self,
        share_id: &ShareId,
        modified: &[ModifiedItem],
    ) -> Result<Vec<ItemRevision>> {
        let mut updated = Vec::with_capacity(modified.len());
        for change in modified {
            let Some(cached) = self.revision(share_id, &change.item_id).await? else {
                continue;
            };
            let mut revision = cached.revision;
            revision.revision = change.revision;
            revision.state = change.state;
            revision.modify_time = change.modify_time;
            revision.revision_time = change.revision_time;
            updated.push(revision);
        }
        Ok(updated)
    }

    /// Merge last-use timestamps. Revisions and pending flags are untouched.
    pub async fn apply_last_use(&self, share_id: &ShareId, last_use: &[LastUseItem]) -> Result<()> {
        let mut changes = self.changes(share_id);
        for entry in last_use {
            if let Some(cached) = self.revision(share_id, &entry.item_id).await? {
                changes.merge_last_use(&cached, entry.last_use_time).await?;
            }
        }
        changes.commit().await?;
        Ok(())
    }

    pub async fn enqueue(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        base_revision: i64,
        kind: &MutationKind,
    ) -> Result<i64> {
        let mut changes = self.changes(share_id);
        changes.enqueue(item_id, base_revision, kind).await?;
        let seq = changes.commit().await?.pop().unwrap_or_default();
        debug!(share_id = %share_id, item_id = %item_id, seq, kind = kind.label(), "Queued mutation");
        Ok(seq)
    }

    async fn seal_mutation(&self, mutation: &PendingMutation) -> Result<StoredMutation> {
        let serialized = serde_json::to_vec(&mutation.kind)
            .map_err(|e| crate::VaultSyncError::Serialization(e.to_string()))?;
        Ok(StoredMutation {
            seq: mutation.seq,
            share_id: mutation.share_id.clone(),
            item_id: mutation.item_id.clone(),
            base_revision: mutation.base_revision,
            payload: self.codec.seal_local(&serialized).await?,
            conflicted: mutation.conflicted,
            queued_at: mutation.queued_at,
        })
    }

    /// Queued mutations of a share, oldest first. Entries that no longer
    /// unwrap are dropped.
    pub async fn pending_mutations(&self, share_id: &ShareId) -> Result<Vec<PendingMutation>> {
        let stored = self.store.queued_mutations(share_id).await?;
        let mut mutations = Vec::with_capacity(stored.len());
        let mut unreadable = Vec::new();
        for entry in stored {
            let kind = match self.codec.open_local(&entry.payload).await {
                Ok(bytes) => serde_json::from_slice::<MutationKind>(&bytes).ok(),
                Err(crate::VaultSyncError::Crypto(_)) => None,
                Err(e) => return Err(e),
            };
            match kind {
                Some(kind) => mutations.push(PendingMutation {
                    seq: entry.seq,
                    share_id: entry.share_id,
                    item_id: entry.item_id,
                    base_revision: entry.base_revision,
                    kind,
                    conflicted: entry.conflicted,
                    queued_at: entry.queued_at,
                }),
                None => {
                    warn!(share_id = %share_id, seq = entry.seq, "Dropping unreadable queued mutation");
                    unreadable.push(entry.seq);
                }
            }
        }
        if !unreadable.is_empty() {
            self.store.remove_mutations(&unreadable).await?;
        }
        Ok(mutations)
    }

    /// Persist a changed base revision or conflict flag.
    pub async fn update_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        let stored = self.seal_mutation(mutation).await?;
        Ok(self.store.update_mutation(&stored).await?)
    }

    pub async fn complete_mutations(&self, seqs: &[i64]) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        Ok(self.store.remove_mutations(seqs).await?)
    }

    pub async fn shares(&self) -> Result<Vec<Share>> {
        Ok(self.store.list_shares().await?)
    }

    pub async fn put_share(&self, share: &Share) -> Result<()> {
        Ok(self.store.upsert_share(share).await?)
    }

    /// Remove a share with its items, cursor and queued mutations.
    pub async fn remove_share(&self, share_id: &ShareId) -> Result<()> {
        self.store.delete_share(share_id).await?;
        self.store.delete_share_metadata(share_id).await?;
        Ok(())
    }

    pub async fn cursor(&self, share_id: &ShareId) -> Result<SyncCursor> {
        Ok(self
            .store
            .load_cursor(share_id)
            .await?
            .unwrap_or_else(|| SyncCursor::new(share_id.clone())))
    }

    pub async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        Ok(self.store.save_cursor(cursor).await?)
    }

    pub async fn clear_cursors(&self) -> Result<()> {
        Ok(self.store.clear_cursors().await?)
    }

    pub async fn clear_all(&self) -> Result<()> {
        Ok(self.store.clear_all().await?)
    }

    async fn unwrap_record(&self, record: SymmetricallyEncryptedItem) -> Result<Option<CachedRevision>> {
        match self.codec.symmetrically_decrypt(&record).await {
            Ok(revision) => Ok(Some(CachedRevision {
                revision,
                pending: record.pending,
            })),
            Err(crate::VaultSyncError::Crypto(e)) => {
                warn!(
                    share_id = %record.share_id,
                    item_id = %record.item_id,
                    error = %e,
                    "Local record does not unwrap; deleting it"
                );
                self.store
                    .delete(&record.share_id, std::slice::from_ref(&record.item_id))
                    .await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Changes to one share collected for [`LocalCache`]; nothing is written
/// until [`commit`](Self::commit).
pub struct CacheChanges<'a> {
    cache: &'a LocalCache,
    write: CacheWrite,
}

impl CacheChanges<'_> {
    pub async fn put(&mut self, revisions: &[ItemRevision], pending: bool) -> Result<()> {
        for revision in revisions {
            let record = self
                .cache
                .codec
                .symmetrically_encrypt(&self.write.share_id, revision, pending)
                .await?;
            self.write.upsert.push(record);
        }
        Ok(())
    }

    /// Move the last-use time of `cached` forward. Older times are ignored.
    pub async fn merge_last_use(&mut self, cached: &CachedRevision, last_use_time: i64) -> Result<()> {
        if cached.revision.last_use_time.is_some_and(|t| t >= last_use_time) {
            return Ok(());
        }
        let mut revision = cached.revision.clone();
        revision.last_use_time = Some(last_use_time);
        self.put(&[revision], cached.pending).await
    }

    pub fn remove(&mut self, item_ids: &[ItemId]) {
        self.write.delete.extend_from_slice(item_ids);
    }

    pub fn clear_pending(&mut self, item_ids: &[ItemId]) {
        self.write.clear_pending.extend_from_slice(item_ids);
    }

    pub async fn enqueue(&mut self, item_id: &ItemId, base_revision: i64, kind: &MutationKind) -> Result<()> {
        let stored = self
            .cache
            .seal_mutation(&PendingMutation {
                seq: 0,
                share_id: self.write.share_id.clone(),
                item_id: item_id.clone(),
                base_revision,
                kind: kind.clone(),
                conflicted: false,
                queued_at: chrono::Utc::now().timestamp(),
            })
            .await?;
        self.write.enqueue.push(stored);
        Ok(())
    }

    pub async fn update_mutation(&mut self, mutation: &PendingMutation) -> Result<()> {
        let stored = self.cache.seal_mutation(mutation).await?;
        self.write.update.push(stored);
        Ok(())
    }

    pub fn complete(&mut self, seqs: &[i64]) {
        self.write.complete.extend_from_slice(seqs);
    }

    /// Write everything at once. Returns the sequence numbers of enqueued
    /// mutations.
    pub async fn commit(self) -> Result<Vec<i64>> {
        if self.write.is_empty() {
            return Ok(Vec::new());
        }
        let share_id = self.write.share_id.clone();
        let (records, queued) = (self.write.upsert.len(), self.write.enqueue.len());
        let seqs = self.cache.store.commit(self.write).await?;
        debug!(share_id = %share_id, records, queued, "Committed cache changes");
        Ok(seqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_key::SymmetricKeyProvider;
    use crate::secret_store::{MemorySecretStore, SecretStore};

    fn revision(id: &str, rev: i64) -> ItemRevision {
        ItemRevision {
            item_id: ItemId::from(id),
            revision: rev,
            content_format_version: 1,
            key_rotation: 1,
            content: "c2VhbGVk".to_string(),
            state: ItemState::Active,
            create_time: 1,
            modify_time: rev,
            last_use_time: None,
            revision_time: rev,
        }
    }

    fn cache_with(secrets: Arc<dyn SecretStore>) -> (LocalCache, Arc<SqliteItemStore>) {
        let store = Arc::new(SqliteItemStore::in_memory().unwrap());
        let codec = Arc::new(ItemCryptoCodec::new(Arc::new(SymmetricKeyProvider::new(secrets))));
        (LocalCache::sqlite(store.clone(), codec), store)
    }

    #[tokio::test]
    async fn put_then_read_back() {
        let (cache, _) = cache_with(Arc::new(MemorySecretStore::new()));
        let share = ShareId::from("s1");
        cache.put(&share, &[revision("a", 1), revision("b", 2)], false).await.unwrap();

        let cached = cache.revision(&share, &ItemId::from("b")).await.unwrap().unwrap();
        assert_eq!(cached.revision.revision, 2);
        assert!(!cached.pending);
        assert_eq!(cache.revisions(&share, Some(ItemState::Active)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn undecryptable_record_is_deleted_and_reported_absent() {
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let (cache, store) = cache_with(secrets.clone());
        let share = ShareId::from("s1");
        cache.put(&share, &[revision("a", 1)], false).await.unwrap();

        // a different device key cannot open the record
        let codec = Arc::new(ItemCryptoCodec::new(Arc::new(SymmetricKeyProvider::with_slot(
            secrets,
            "other-device-key",
        ))));
        let other = LocalCache::sqlite(store.clone(), codec);

        assert!(other.revision(&share, &ItemId::from("a")).await.unwrap().is_none());
        assert!(store.get(&share, &ItemId::from("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn modified_items_update_state_and_revision() {
        let (cache, _) = cache_with(Arc::new(MemorySecretStore::new()));
        let share = ShareId::from("s1");
        cache.put(&share, &[revision("a", 1)], true).await.unwrap();

        cache
            .apply_modified(
                &share,
                &[ModifiedItem {
                    item_id: ItemId::from("a"),
                    revision: 2,
                    state: ItemState::Trashed,
                    modify_time: 9,
                    revision_time: 9,
                }],
            )
            .await
            .unwrap();

        let cached = cache.revision(&share, &ItemId::from("a")).await.unwrap().unwrap();
        assert_eq!(cached.revision.state, ItemState::Trashed);
        assert_eq!(cached.revision.revision, 2);
        assert!(!cached.pending);
        assert!(cache.revisions(&share, Some(ItemState::Active)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_use_only_moves_forward() {
        let (cache, _) = cache_with(Arc::new(MemorySecretStore::new()));
        let share = ShareId::from("s1");
        let item = ItemId::from("a");
        cache.put(&share, &[revision("a", 3)], false).await.unwrap();

        let touch = |t| LastUseItem {
            item_id: item.clone(),
            last_use_time: t,
        };
        cache.apply_last_use(&share, &[touch(50)]).await.unwrap();
        cache.apply_last_use(&share, &[touch(20)]).await.unwrap();

        let cached = cache.revision(&share, &item).await.unwrap().unwrap();
        assert_eq!(cached.revision.last_use_time, Some(50));
        assert_eq!(cached.revision.revision, 3);
    }

    #[tokio::test]
    async fn mutations_roundtrip_in_order() {
        let (cache, _) = cache_with(Arc::new(MemorySecretStore::new()));
        let share = ShareId::from("s1");
        let first = cache
            .enqueue(&share, &ItemId::from("a"), 1, &MutationKind::Trash)
            .await
            .unwrap();
        let second = cache
            .enqueue(&share, &ItemId::from("b"), 0, &MutationKind::LastUse { last_use_time: 4 })
            .await
            .unwrap();
        assert!(first < second);

        let mut queued = cache.pending_mutations(&share).await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].kind, MutationKind::Trash);

        queued[0].conflicted = true;
        cache.update_mutation(&queued[0]).await.unwrap();
        cache.complete_mutations(&[second]).await.unwrap();

        let queued = cache.pending_mutations(&share).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].conflicted);
    }

    #[tokio::test]
    async fn cursor_defaults_to_empty() {
        let (cache, _) = cache_with(Arc::new(MemorySecretStore::new()));
        let cursor = cache.cursor(&ShareId::from("s1")).await.unwrap();
        assert!(cursor.known_revisions.is_empty());
        assert!(cursor.in_progress.is_none());
    }

    #[tokio::test]
    async fn changes_apply_record_and_outbox_at_once() {
        let (cache, _) = cache_with(Arc::new(MemorySecretStore::new()));
        let share = ShareId::from("s1");
        let item = ItemId::from("a");
        let stale = cache.enqueue(&share, &item, 1, &MutationKind::Trash).await.unwrap();

        let mut changes = cache.changes(&share);
        changes.complete(&[stale]);
        changes.put(&[revision("a", 2)], true).await.unwrap();
        changes.enqueue(&item, 2, &MutationKind::Delete).await.unwrap();
        // nothing is visible before the commit
        assert!(cache.revision(&share, &item).await.unwrap().is_none());
        let seqs = changes.commit().await.unwrap();

        let queued = cache.pending_mutations(&share).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].seq, seqs[0]);
        assert_eq!(queued[0].kind, MutationKind::Delete);
        assert_eq!(queued[0].base_revision, 2);
        let cached = cache.revision(&share, &item).await.unwrap().unwrap();
        assert!(cached.pending);
    }

    #[tokio::test]
    async fn empty_changes_commit_nothing() {
        let (cache, _) = cache_with(Arc::new(MemorySecretStore::new()));
        assert!(cache.changes(&ShareId::from("s1")).commit().await.unwrap().is_empty());
    }
}
