//! In-memory server and vault fixtures shared by unit tests.

use crate::codec::{item_content, EncryptedContent, ItemContent, ItemCryptoCodec, Login};
use crate::config::SyncConfig;
use crate::device_key::SymmetricKeyProvider;
use crate::keys::{AddressKey, EncryptedKeyChainEntry, KeyChainEntry};
use crate::models::{
    CreateItemRequest, ItemBatchRequest, ItemId, ItemRevision, ItemState, ModifiedItem, Share,
    ShareId, UpdateItemRequest, VaultContentRequest,
};
use crate::remote::{CreateVaultRequest, PushOperation, RemoteApi, RemoteError, RemoteSyncClient};
use crate::secret_store::MemorySecretStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub(crate) const TEST_ADDRESS_SEED: [u8; 32] = [7u8; 32];

/// The address key every test vault is signed with.
pub(crate) fn test_address() -> AddressKey {
    AddressKey::from_seed("address-1", &TEST_ADDRESS_SEED)
}

pub(crate) fn test_codec() -> ItemCryptoCodec {
    ItemCryptoCodec::new(Arc::new(SymmetricKeyProvider::new(Arc::new(
        MemorySecretStore::new(),
    ))))
}

/// Fast retries so failure tests do not sleep for long.
pub(crate) fn test_config() -> SyncConfig {
    SyncConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 4,
        ..SyncConfig::default()
    }
}

pub(crate) fn login(name: &str) -> ItemContent {
    ItemContent {
        name: name.to_string(),
        note: String::new(),
        item_uuid: String::new(),
        data: Some(item_content::Data::Login(Login {
            username: format!("{}@example.com", name),
            password: format!("{}-password", name),
            urls: vec![format!("https://{}.example.com", name)],
            totp_uri: String::new(),
        })),
        extra_fields: Vec::new(),
    }
}

#[derive(Default)]
struct ServerState {
    shares: BTreeMap<ShareId, Share>,
    keys: HashMap<ShareId, Vec<EncryptedKeyChainEntry>>,
    items: HashMap<ShareId, BTreeMap<ItemId, ItemRevision>>,
    clock: i64,
    next_share: u64,
}

impl ServerState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        1_700_000_000 + self.clock
    }

    fn share_items(&mut self, share_id: &ShareId) -> Result<&mut BTreeMap<ItemId, ItemRevision>, RemoteError> {
        if !self.shares.contains_key(share_id) {
            return Err(RemoteError::NotFound(format!("share {}", share_id)));
        }
        Ok(self.items.entry(share_id.clone()).or_default())
    }

    fn change_state(
        &mut self,
        share_id: &ShareId,
        request: &ItemBatchRequest,
        state: ItemState,
    ) -> Result<Vec<ModifiedItem>, RemoteError> {
        let now = self.tick();
        let items = self.share_items(share_id)?;
        check_batch(items, request)?;
        let mut modified = Vec::with_capacity(request.items.len());
        for reference in &request.items {
            if let Some(item) = items.get_mut(&reference.item_id) {
                item.revision += 1;
                item.state = state;
                item.modify_time = now;
                item.revision_time = now;
                modified.push(ModifiedItem {
                    item_id: item.item_id.clone(),
                    revision: item.revision,
                    state,
                    modify_time: now,
                    revision_time: now,
                });
            }
        }
        Ok(modified)
    }
}

/// Rejects the whole batch when any referenced item is missing or stale.
fn check_batch(
    items: &BTreeMap<ItemId, ItemRevision>,
    request: &ItemBatchRequest,
) -> Result<(), RemoteError> {
    for reference in &request.items {
        match items.get(&reference.item_id) {
            None => return Err(RemoteError::NotFound(format!("item {}", reference.item_id))),
            Some(item) if item.revision != reference.revision => {
                return Err(RemoteError::Conflict(format!(
                    "item {} is at revision {}, not {}",
                    item.item_id, item.revision, reference.revision
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

struct WriteGuard<'a>(&'a AtomicUsize);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A server that keeps everything in memory and can be told to misbehave.
#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<ServerState>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, VecDeque<RemoteError>>>,
    list_delay: Mutex<Duration>,
    write_delay: Mutex<Duration>,
    list_gate: Mutex<Option<Arc<Semaphore>>>,
    listing_failure: Mutex<Option<(u32, RemoteError)>>,
    races: Mutex<HashSet<ItemId>>,
    in_flight_writes: AtomicUsize,
    max_writes: AtomicUsize,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn client(self: &Arc<Self>) -> RemoteSyncClient {
        self.client_with(&test_config())
    }

    pub(crate) fn client_with(self: &Arc<Self>, config: &SyncConfig) -> RemoteSyncClient {
        RemoteSyncClient::new(self.clone(), config)
    }

    pub(crate) fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    pub(crate) fn key_fetches(&self) -> usize {
        self.calls("list_share_keys")
    }

    /// Fail the next call of `operation` with `error`. Queued failures are consumed in order.
    pub(crate) fn fail_next(&self, operation: &'static str, error: RemoteError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub(crate) fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    pub(crate) fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub(crate) fn max_concurrent_writes(&self) -> usize {
        self.max_writes.load(Ordering::SeqCst)
    }

    /// Block every `list_items` call until [`release_listings`](Self::release_listings).
    pub(crate) fn hold_listings(&self) {
        *self.list_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release_listings(&self) {
        if let Some(gate) = self.list_gate.lock().unwrap().take() {
            gate.add_permits(1);
        }
    }

    /// Fail every `list_items` call for `page` and later pages until cleared.
    pub(crate) fn fail_listing_from(&self, page: u32, error: RemoteError) {
        *self.listing_failure.lock().unwrap() = Some((page, error));
    }

    pub(crate) fn clear_listing_failure(&self) {
        *self.listing_failure.lock().unwrap() = None;
    }

    /// After the next `get_item` of `item_id`, edit the item again on the server.
    pub(crate) fn race_after_get(&self, item_id: &ItemId) {
        self.races.lock().unwrap().insert(item_id.clone());
    }

    pub(crate) fn add_share(&self, share: Share, keys: EncryptedKeyChainEntry) {
        let mut state = self.state.lock().unwrap();
        state.keys.insert(share.share_id.clone(), vec![keys]);
        state.items.entry(share.share_id.clone()).or_default();
        state.shares.insert(share.share_id.clone(), share);
    }

    pub(crate) fn add_key(&self, share_id: &ShareId, keys: EncryptedKeyChainEntry) {
        let mut state = self.state.lock().unwrap();
        if let Some(share) = state.shares.get_mut(share_id) {
            share.key_rotation = share.key_rotation.max(keys.rotation);
        }
        state.keys.entry(share_id.clone()).or_default().push(keys);
    }

    pub(crate) fn remove_share(&self, share_id: &ShareId) {
        let mut state = self.state.lock().unwrap();
        state.shares.remove(share_id);
        state.keys.remove(share_id);
        state.items.remove(share_id);
    }

    pub(crate) fn share(&self, share_id: &ShareId) -> Option<Share> {
        self.state.lock().unwrap().shares.get(share_id).cloned()
    }

    pub(crate) fn key_chain(&self, share_id: &ShareId) -> Vec<EncryptedKeyChainEntry> {
        self.state
            .lock()
            .unwrap()
            .keys
            .get(share_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Rewrite every stored chain entry of a share.
    pub(crate) fn tamper_key_chain(
        &self,
        share_id: &ShareId,
        tamper: impl Fn(&mut EncryptedKeyChainEntry),
    ) {
        if let Some(entries) = self.state.lock().unwrap().keys.get_mut(share_id) {
            entries.iter_mut().for_each(tamper);
        }
    }

    pub(crate) fn items(&self, share_id: &ShareId) -> Vec<ItemRevision> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(share_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn item(&self, share_id: &ShareId, item_id: &ItemId) -> Option<ItemRevision> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(share_id)
            .and_then(|items| items.get(item_id).cloned())
    }

    /// Create or edit an item directly on the server.
    pub(crate) fn upsert_item(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        content: &EncryptedContent,
    ) -> ItemRevision {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        let items = state.items.entry(share_id.clone()).or_default();
        let item = items.entry(item_id.clone()).or_insert_with(|| ItemRevision {
            item_id: item_id.clone(),
            revision: 0,
            content_format_version: content.content_format_version,
            key_rotation: content.key_rotation,
            content: String::new(),
            state: ItemState::Active,
            create_time: now,
            modify_time: now,
            last_use_time: None,
            revision_time: now,
        });
        item.revision += 1;
        item.content = content.content.clone();
        item.key_rotation = content.key_rotation;
        item.content_format_version = content.content_format_version;
        item.modify_time = now;
        item.revision_time = now;
        item.clone()
    }

    /// Store a revision as given, bypassing every check.
    pub(crate) fn put_raw_item(&self, share_id: &ShareId, item: ItemRevision) {
        self.state
            .lock()
            .unwrap()
            .items
            .entry(share_id.clone())
            .or_default()
            .insert(item.item_id.clone(), item);
    }

    pub(crate) fn set_item_state(&self, share_id: &ShareId, item_id: &ItemId, state: ItemState) -> ItemRevision {
        let mut server = self.state.lock().unwrap();
        let now = server.tick();
        let item = server
            .items
            .get_mut(share_id)
            .and_then(|items| items.get_mut(item_id))
            .expect("item exists on the fake server");
        item.revision += 1;
        item.state = state;
        item.modify_time = now;
        item.revision_time = now;
        item.clone()
    }

    pub(crate) fn remove_item(&self, share_id: &ShareId, item_id: &ItemId) {
        if let Some(items) = self.state.lock().unwrap().items.get_mut(share_id) {
            items.remove(item_id);
        }
    }

    fn enter(&self, operation: &'static str) -> Result<(), RemoteError> {
        *self.calls.lock().unwrap().entry(operation).or_default() += 1;
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(|queue| queue.pop_front());
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn begin_write(&self) -> WriteGuard<'_> {
        let now = self.in_flight_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_writes.fetch_max(now, Ordering::SeqCst);
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        WriteGuard(&self.in_flight_writes)
    }
}

fn page_of<T: Clone>(all: impl Iterator<Item = T>, page: u32, page_size: u32) -> Vec<T> {
    all.skip((page as usize) * (page_size as usize))
        .take(page_size as usize)
        .collect()
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn list_shares(&self) -> Result<Vec<Share>, RemoteError> {
        self.enter("list_shares")?;
        Ok(self.state.lock().unwrap().shares.values().cloned().collect())
    }

    async fn list_share_keys(
        &self,
        share_id: &ShareId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<EncryptedKeyChainEntry>, RemoteError> {
        self.enter("list_share_keys")?;
        let state = self.state.lock().unwrap();
        let keys = state
            .keys
            .get(share_id)
            .ok_or_else(|| RemoteError::NotFound(format!("share {}", share_id)))?;
        Ok(page_of(keys.iter().cloned(), page, page_size))
    }

    async fn list_items(
        &self,
        share_id: &ShareId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ItemRevision>, RemoteError> {
        self.enter("list_items")?;
        let failure = self.listing_failure.lock().unwrap().clone();
        if let Some((from, error)) = failure {
            if page >= from {
                return Err(error);
            }
        }
        let gate = self.list_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        let delay = *self.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let items = state.share_items(share_id)?;
        Ok(page_of(items.values().cloned(), page, page_size))
    }

    async fn get_item(&self, share_id: &ShareId, item_id: &ItemId) -> Result<ItemRevision, RemoteError> {
        self.enter("get_item")?;
        let mut state = self.state.lock().unwrap();
        let found = state
            .share_items(share_id)?
            .get(item_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("item {}", item_id)))?;
        if self.races.lock().unwrap().remove(item_id) {
            let now = state.tick();
            if let Some(item) = state.share_items(share_id)?.get_mut(item_id) {
                item.revision += 1;
                item.modify_time = now;
                item.revision_time = now;
            }
        }
        Ok(found)
    }

    async fn create_item(
        &self,
        share_id: &ShareId,
        request: &CreateItemRequest,
    ) -> Result<ItemRevision, RemoteError> {
        self.enter("create_item")?;
        let _write = self.begin_write().await;
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        let items = state.share_items(share_id)?;
        if items.contains_key(&request.item_id) {
            return Err(RemoteError::Conflict(format!("item {} exists", request.item_id)));
        }
        let item = ItemRevision {
            item_id: request.item_id.clone(),
            revision: 1,
            content_format_version: request.content_format_version,
            key_rotation: request.key_rotation,
            content: request.content.clone(),
            state: ItemState::Active,
            create_time: now,
            modify_time: now,
            last_use_time: None,
            revision_time: now,
        };
        items.insert(item.item_id.clone(), item.clone());
        Ok(item)
    }

    async fn update_item(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        request: &UpdateItemRequest,
    ) -> Result<ItemRevision, RemoteError> {
        self.enter("update_item")?;
        let _write = self.begin_write().await;
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        let item = state
            .share_items(share_id)?
            .get_mut(item_id)
            .ok_or_else(|| RemoteError::NotFound(format!("item {}", item_id)))?;
        if item.revision != request.last_revision {
            return Err(RemoteError::Conflict(format!(
                "item {} is at revision {}, not {}",
                item_id, item.revision, request.last_revision
            )));
        }
        item.revision += 1;
        item.content = request.content.clone();
        item.key_rotation = request.key_rotation;
        item.content_format_version = request.content_format_version;
        item.modify_time = now;
        item.revision_time = now;
        Ok(item.clone())
    }

    async fn trash_items(
        &self,
        share_id: &ShareId,
        request: &ItemBatchRequest,
    ) -> Result<Vec<ModifiedItem>, RemoteError> {
        self.enter("trash_items")?;
        let _write = self.begin_write().await;
        self.state
            .lock()
            .unwrap()
            .change_state(share_id, request, ItemState::Trashed)
    }

    async fn untrash_items(
        &self,
        share_id: &ShareId,
        request: &ItemBatchRequest,
    ) -> Result<Vec<ModifiedItem>, RemoteError> {
        self.enter("untrash_items")?;
        let _write = self.begin_write().await;
        self.state
            .lock()
            .unwrap()
            .change_state(share_id, request, ItemState::Active)
    }

    async fn delete_items(&self, share_id: &ShareId, request: &ItemBatchRequest) -> Result<(), RemoteError> {
        self.enter("delete_items")?;
        let _write = self.begin_write().await;
        let mut state = self.state.lock().unwrap();
        let items = state.share_items(share_id)?;
        check_batch(items, request)?;
        for reference in &request.items {
            items.remove(&reference.item_id);
        }
        Ok(())
    }

    async fn update_last_use(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        last_use_time: i64,
    ) -> Result<(), RemoteError> {
        self.enter("update_last_use")?;
        let _write = self.begin_write().await;
        let mut state = self.state.lock().unwrap();
        let item = state
            .share_items(share_id)?
            .get_mut(item_id)
            .ok_or_else(|| RemoteError::NotFound(format!("item {}", item_id)))?;
        item.last_use_time = Some(last_use_time);
        Ok(())
    }

    async fn create_vault(&self, request: &CreateVaultRequest) -> Result<Share, RemoteError> {
        self.enter("create_vault")?;
        let _write = self.begin_write().await;
        let mut state = self.state.lock().unwrap();
        state.next_share += 1;
        let now = state.tick();
        let share = Share {
            share_id: ShareId(format!("share-{}", state.next_share)),
            vault_id: request.vault_id.clone(),
            owner: true,
            key_rotation: request.keys.rotation,
            content: Some(request.content.clone()),
            content_key_rotation: Some(request.keys.rotation),
            content_format_version: Some(request.content_format_version),
            create_time: now,
        };
        state.keys.insert(share.share_id.clone(), vec![request.keys.clone()]);
        state.items.insert(share.share_id.clone(), BTreeMap::new());
        state.shares.insert(share.share_id.clone(), share.clone());
        Ok(share)
    }

    async fn update_vault(
        &self,
        share_id: &ShareId,
        request: &VaultContentRequest,
    ) -> Result<Share, RemoteError> {
        self.enter("update_vault")?;
        let _write = self.begin_write().await;
        let mut state = self.state.lock().unwrap();
        let share = state
            .shares
            .get_mut(share_id)
            .ok_or_else(|| RemoteError::NotFound(format!("share {}", share_id)))?;
        share.content = Some(request.content.clone());
        share.content_key_rotation = Some(request.key_rotation);
        share.content_format_version = Some(request.content_format_version);
        Ok(share.clone())
    }

    async fn delete_vault(&self, share_id: &ShareId) -> Result<(), RemoteError> {
        self.enter("delete_vault")?;
        let _write = self.begin_write().await;
        let mut state = self.state.lock().unwrap();
        if state.shares.remove(share_id).is_none() {
            return Err(RemoteError::NotFound(format!("share {}", share_id)));
        }
        state.keys.remove(share_id);
        state.items.remove(share_id);
        Ok(())
    }
}

/// A vault registered on a [`FakeRemote`], with its unlocked keys kept for
/// producing server-side content.
pub(crate) struct TestVault {
    pub share_id: ShareId,
    pub vault_id: String,
    keys: Mutex<Vec<Arc<KeyChainEntry>>>,
    codec: ItemCryptoCodec,
}

impl TestVault {
    pub(crate) fn new(remote: &FakeRemote, share_id: &str) -> Self {
        let vault_id = format!("vault-{}", share_id);
        let (entry, encrypted) = KeyChainEntry::generate(&vault_id, 1, &test_address(), 1)
            .expect("generate key chain");
        let codec = test_codec();
        let content = codec
            .encrypt_vault_content(
                &crate::codec::VaultContent {
                    name: format!("Vault {}", share_id),
                    description: String::new(),
                },
                &entry,
            )
            .expect("encrypt vault content");
        let share = Share {
            share_id: ShareId::from(share_id),
            vault_id: vault_id.clone(),
            owner: true,
            key_rotation: 1,
            content: Some(content.content),
            content_key_rotation: Some(1),
            content_format_version: Some(content.content_format_version),
            create_time: 1,
        };
        remote.add_share(share, encrypted);
        Self {
            share_id: ShareId::from(share_id),
            vault_id,
            keys: Mutex::new(vec![Arc::new(entry)]),
            codec,
        }
    }

    pub(crate) fn address(&self) -> AddressKey {
        test_address()
    }

    /// Add the next rotation on the server. Returns the new rotation.
    pub(crate) fn rotate(&self, remote: &FakeRemote) -> i64 {
        let mut keys = self.keys.lock().unwrap();
        let rotation = keys.len() as i64 + 1;
        let (entry, encrypted) = KeyChainEntry::generate(&self.vault_id, rotation, &test_address(), rotation)
            .expect("generate key chain");
        remote.add_key(&self.share_id, encrypted);
        keys.push(Arc::new(entry));
        rotation
    }

    pub(crate) fn keys(&self, rotation: i64) -> Arc<KeyChainEntry> {
        self.keys.lock().unwrap()[(rotation - 1) as usize].clone()
    }

    pub(crate) fn latest(&self) -> Arc<KeyChainEntry> {
        self.keys
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("vault has keys")
    }

    pub(crate) fn encrypt(&self, name: &str) -> EncryptedContent {
        self.codec
            .encrypt(&login(name), &self.latest())
            .expect("encrypt content")
    }

    /// Create or edit an item on the server with content named `name`.
    pub(crate) fn server_item(&self, remote: &FakeRemote, item_id: &str, name: &str) -> ItemRevision {
        remote.upsert_item(&self.share_id, &ItemId::from(item_id), &self.encrypt(name))
    }

    pub(crate) fn decrypt(&self, item: &ItemRevision) -> ItemContent {
        self.codec
            .decrypt_item(item, &self.keys(item.key_rotation))
            .expect("decrypt content")
    }

    pub(crate) fn create_operation(&self, item_id: &str, name: &str) -> PushOperation {
        let content = self.encrypt(name);
        PushOperation::Create(CreateItemRequest {
            item_id: ItemId::from(item_id),
            key_rotation: content.key_rotation,
            content_format_version: content.content_format_version,
            content: content.content,
        })
    }
}
