//! Remote sync client: pagination, per-call timeouts, retries, and
//! serialization of writes per share.

use crate::config::SyncConfig;
use crate::keys::EncryptedKeyChainEntry;
use crate::models::{
    CreateItemRequest, ItemBatchRequest, ItemId, ItemRevision, ItemRevisionRef, ModifiedItem,
    Share, ShareId, UpdateItemRequest, VaultContentRequest,
};
use crate::remote::{CreateVaultRequest, RemoteApi, RemoteError};
use crate::session::SessionMonitor;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, RemoteError>;

/// Exponential retry schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A write to push to the server.
#[derive(Debug, Clone)]
pub enum PushOperation {
    Create(CreateItemRequest),
    Update {
        item_id: ItemId,
        request: UpdateItemRequest,
    },
    Trash(Vec<ItemRevisionRef>),
    Untrash(Vec<ItemRevisionRef>),
    Delete(Vec<ItemRevisionRef>),
    LastUse {
        item_id: ItemId,
        last_use_time: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Revision(ItemRevision),
    Modified(Vec<ModifiedItem>),
    Deleted(Vec<ItemId>),
    LastUseRecorded,
}

/// Wraps a [`RemoteApi`] with the policies every sync call needs.
pub struct RemoteSyncClient {
    api: Arc<dyn RemoteApi>,
    retry: RetryPolicy,
    timeout: Duration,
    page_size: u32,
    batch_size: usize,
    session: Option<Arc<SessionMonitor>>,
    write_locks: Mutex<HashMap<ShareId, Arc<tokio::sync::Mutex<()>>>>,
}

impl RemoteSyncClient {
    pub fn new(api: Arc<dyn RemoteApi>, config: &SyncConfig) -> Self {
        Self {
            api,
            retry: RetryPolicy::from_config(config),
            timeout: config.request_timeout(),
            page_size: config.page_size.max(1),
            batch_size: config.batch_size.max(1),
            session: None,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Report `AuthorizationExpired` responses to `session`.
    pub fn with_session(mut self, session: Arc<SessionMonitor>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// One page of item revisions. Pages are 0-based; a page shorter than
    /// [`page_size`](Self::page_size) is the last one.
    pub async fn fetch_page(&self, share_id: &ShareId, page: u32) -> Result<Vec<ItemRevision>> {
        let api = self.api.as_ref();
        let page_size = self.page_size;
        let items = self
            .call("list_items", move || api.list_items(share_id, page, page_size))
            .await?;
        debug!(share_id = %share_id, page, count = items.len(), "Fetched item page");
        Ok(items)
    }

    /// Every current revision of a share, following pagination to the end.
    pub async fn fetch_all_revisions(&self, share_id: &ShareId) -> Result<Vec<ItemRevision>> {
        let mut all = Vec::new();
        let mut page = 0;
        loop {
            let items = self.fetch_page(share_id, page).await?;
            let last = (items.len() as u32) < self.page_size;
            all.extend(items);
            if last {
                return Ok(all);
            }
            page += 1;
        }
    }

    /// Every rotation of a share's key chain.
    pub async fn fetch_key_chain(&self, share_id: &ShareId) -> Result<Vec<EncryptedKeyChainEntry>> {
        let api = self.api.as_ref();
        let page_size = self.page_size;
        let mut all = Vec::new();
        let mut page = 0;
        loop {
            let entries = self
                .call("list_share_keys", move || {
                    api.list_share_keys(share_id, page, page_size)
                })
                .await?;
            let last = (entries.len() as u32) < page_size;
            all.extend(entries);
            if last {
                return Ok(all);
            }
            page += 1;
        }
    }

    pub async fn list_shares(&self) -> Result<Vec<Share>> {
        let api = self.api.as_ref();
        self.call("list_shares", move || api.list_shares()).await
    }

    pub async fn get_item(&self, share_id: &ShareId, item_id: &ItemId) -> Result<ItemRevision> {
        let api = self.api.as_ref();
        self.call("get_item", move || api.get_item(share_id, item_id))
            .await
    }

    /// Push one write. Writes to the same share never overlap.
    pub async fn push(&self, share_id: &ShareId, operation: &PushOperation) -> Result<PushOutcome> {
        let lock = self.write_lock(share_id);
        let _guard = lock.lock().await;
        let api = self.api.as_ref();

        match operation {
            PushOperation::Create(request) => self
                .call("create_item", move || api.create_item(share_id, request))
                .await
                .map(PushOutcome::Revision),
            PushOperation::Update { item_id, request } => self
                .call("update_item", move || api.update_item(share_id, item_id, request))
                .await
                .map(PushOutcome::Revision),
            PushOperation::Trash(items) => {
                let mut modified = Vec::with_capacity(items.len());
                for chunk in items.chunks(self.batch_size) {
                    let request = ItemBatchRequest {
                        items: chunk.to_vec(),
                    };
                    let request = &request;
                    modified.extend(
                        self.call("trash_items", move || api.trash_items(share_id, request))
                            .await?,
                    );
                }
                Ok(PushOutcome::Modified(modified))
            }
            PushOperation::Untrash(items) => {
                let mut modified = Vec::with_capacity(items.len());
                for chunk in items.chunks(self.batch_size) {
                    let request = ItemBatchRequest {
                        items: chunk.to_vec(),
                    };
                    let request = &request;
                    modified.extend(
                        self.call("untrash_items", move || api.untrash_items(share_id, request))
                            .await?,
                    );
                }
                Ok(PushOutcome::Modified(modified))
            }
            PushOperation::Delete(items) => {
                for chunk in items.chunks(self.batch_size) {
                    let request = ItemBatchRequest {
                        items: chunk.to_vec(),
                    };
                    let request = &request;
                    self.call("delete_items", move || api.delete_items(share_id, request))
                        .await?;
                }
                Ok(PushOutcome::Deleted(
                    items.iter().map(|item| item.item_id.clone()).collect(),
                ))
            }
            PushOperation::LastUse {
                item_id,
                last_use_time,
            } => {
                let time = *last_use_time;
                self.call("update_last_use", move || {
                    api.update_last_use(share_id, item_id, time)
                })
                .await
                .map(|_| PushOutcome::LastUseRecorded)
            }
        }
    }

    pub async fn create_vault(&self, request: &CreateVaultRequest) -> Result<Share> {
        let api = self.api.as_ref();
        self.call("create_vault", move || api.create_vault(request))
            .await
    }

    pub async fn update_vault(&self, share_id: &ShareId, request: &VaultContentRequest) -> Result<Share> {
        let lock = self.write_lock(share_id);
        let _guard = lock.lock().await;
        let api = self.api.as_ref();
        self.call("update_vault", move || api.update_vault(share_id, request))
            .await
    }

    pub async fn delete_vault(&self, share_id: &ShareId) -> Result<()> {
        let lock = self.write_lock(share_id);
        let _guard = lock.lock().await;
        let api = self.api.as_ref();
        self.call("delete_vault", move || api.delete_vault(share_id))
            .await
    }

    fn write_lock(&self, share_id: &ShareId) -> Arc<tokio::sync::Mutex<()>> {
        match self.write_locks.lock() {
            Ok(mut locks) => locks.entry(share_id.clone()).or_default().clone(),
            // a poisoned map only loses serialization for this call
            Err(poisoned) => poisoned
                .into_inner()
                .entry(share_id.clone())
                .or_default()
                .clone(),
        }
    }

    /// Run `f` with the per-call timeout, retrying transient failures.
    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Transient(format!(
                    "{} timed out after {:?}",
                    operation, self.timeout
                ))),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(operation, attempt, ?delay, error = %e, "Transient remote error; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(RemoteError::AuthorizationExpired) => {
                    if let Some(session) = &self.session {
                        session.invalidate();
                    }
                    return Err(RemoteError::AuthorizationExpired);
                }
                other => return other,
            }
        }
    }
}
