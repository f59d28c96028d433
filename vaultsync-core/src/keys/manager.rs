//! In-memory cache of unlocked key chains, keyed by share and rotation.

use crate::crypto::CryptoError;
use crate::keys::chain::KeyChainEntry;
use crate::models::ShareId;
use crate::remote::RemoteSyncClient;
use crate::session::UserKeyring;
use crate::{Result, VaultSyncError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

type Chain = BTreeMap<i64, Arc<KeyChainEntry>>;

#[derive(Default)]
struct FetchGate {
    lock: tokio::sync::Mutex<()>,
    completed: AtomicU64,
}

/// Resolves the active and historical keys of every share.
///
/// Chains are fetched from the remote the first time a share is asked for,
/// and again when a caller needs a rotation above the cached maximum. At
/// most one fetch per share is in flight; concurrent callers wait for it.
/// A rotation still absent after a refetch is remembered as missing and
/// fails without another fetch until the chain is loaded again.
pub struct KeyHierarchyManager {
    remote: Arc<RemoteSyncClient>,
    keyring: Arc<dyn UserKeyring>,
    chains: RwLock<HashMap<ShareId, Chain>>,
    missing: Mutex<HashMap<ShareId, BTreeSet<i64>>>,
    fetch_gates: Mutex<HashMap<ShareId, Arc<FetchGate>>>,
    /// Bumped by `wipe()`; a fetch started before a wipe must not repopulate the cache.
    generation: AtomicU64,
}

impl KeyHierarchyManager {
    pub fn new(remote: Arc<RemoteSyncClient>, keyring: Arc<dyn UserKeyring>) -> Self {
        Self {
            remote,
            keyring,
            chains: RwLock::new(HashMap::new()),
            missing: Mutex::new(HashMap::new()),
            fetch_gates: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Keys of the highest rotation of `share_id`. New content is always
    /// encrypted with these.
    pub async fn active_keys(&self, share_id: &ShareId) -> Result<Arc<KeyChainEntry>> {
        if let Some(entry) = self.cached_latest(share_id) {
            return Ok(entry);
        }
        self.load(share_id, false).await?;
        self.cached_latest(share_id).ok_or_else(|| {
            VaultSyncError::NotFound(format!("no keys for share {}", share_id))
        })
    }

    /// Keys of a specific rotation, for reading content written before a rotation.
    pub async fn keys_for_rotation(
        &self,
        share_id: &ShareId,
        rotation: i64,
    ) -> Result<Arc<KeyChainEntry>> {
        if let Some(entry) = self.cached(share_id, rotation) {
            return Ok(entry);
        }
        if !self.is_missing(share_id, rotation) {
            let force = self.cached_latest(share_id).is_some();
            self.load(share_id, force).await?;
            if let Some(entry) = self.cached(share_id, rotation) {
                return Ok(entry);
            }
            debug!(share_id = %share_id, rotation, "Rotation not in refreshed key chain");
            if let Ok(mut missing) = self.missing.lock() {
                missing.entry(share_id.clone()).or_default().insert(rotation);
            }
        }
        let actual = self.cached_latest(share_id).map(|e| e.rotation).unwrap_or(0);
        Err(CryptoError::UnmatchedKeyRotation {
            expected: rotation,
            actual,
        }
        .into())
    }

    /// Make sure rotation `rotation` or newer is cached, refetching if the
    /// share reports a rotation we have not seen.
    pub async fn ensure_rotation(&self, share_id: &ShareId, rotation: i64) -> Result<()> {
        match self.cached_latest(share_id) {
            Some(entry) if entry.rotation >= rotation => Ok(()),
            Some(entry) => {
                info!(
                    share_id = %share_id,
                    cached = entry.rotation,
                    remote = rotation,
                    "New key rotation detected; refreshing key chain"
                );
                self.load(share_id, true).await
            }
            None => self.load(share_id, false).await,
        }
    }

    /// Refetch the chain of `share_id` regardless of cache state.
    pub async fn refresh(&self, share_id: &ShareId) -> Result<()> {
        self.load(share_id, true).await
    }

    /// Insert an entry created locally (new vault, local rotation).
    pub fn insert(&self, share_id: &ShareId, entry: KeyChainEntry) {
        if let Ok(mut chains) = self.chains.write() {
            chains
                .entry(share_id.clone())
                .or_default()
                .insert(entry.rotation, Arc::new(entry));
        }
    }

    /// Drop the cached chain of one share.
    pub fn forget(&self, share_id: &ShareId) {
        if let Ok(mut chains) = self.chains.write() {
            chains.remove(share_id);
        }
        if let Ok(mut missing) = self.missing.lock() {
            missing.remove(share_id);
        }
    }

    /// Drop every cached key. Entries held by in-flight operations are
    /// zeroized once those operations release them.
    pub fn wipe(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut chains) = self.chains.write() {
            chains.clear();
        }
        if let Ok(mut missing) = self.missing.lock() {
            missing.clear();
        }
        if let Ok(mut gates) = self.fetch_gates.lock() {
            gates.clear();
        }
        info!("Key hierarchy wiped");
    }

    pub fn cached_rotations(&self, share_id: &ShareId) -> Vec<i64> {
        self.chains
            .read()
            .ok()
            .and_then(|chains| chains.get(share_id).map(|c| c.keys().copied().collect()))
            .unwrap_or_default()
    }

    fn is_missing(&self, share_id: &ShareId, rotation: i64) -> bool {
        self.missing
            .lock()
            .map(|missing| missing.get(share_id).is_some_and(|r| r.contains(&rotation)))
            .unwrap_or(false)
    }

    fn cached(&self, share_id: &ShareId, rotation: i64) -> Option<Arc<KeyChainEntry>> {
        let chains = self.chains.read().ok()?;
        chains.get(share_id)?.get(&rotation).cloned()
    }

    fn cached_latest(&self, share_id: &ShareId) -> Option<Arc<KeyChainEntry>> {
        let chains = self.chains.read().ok()?;
        chains
            .get(share_id)?
            .last_key_value()
            .map(|(_, entry)| entry.clone())
    }

    fn fetch_gate(&self, share_id: &ShareId) -> Result<Arc<FetchGate>> {
        let mut gates = self
            .fetch_gates
            .lock()
            .map_err(|_| VaultSyncError::KeyUnavailable("key fetch gate poisoned".to_string()))?;
        Ok(gates.entry(share_id.clone()).or_default().clone())
    }

    /// Fetch and unlock the chain of `share_id`, single-flight per share.
    ///
    /// A non-forced load returns early once another caller has populated the
    /// cache. A forced load returns early if a fetch completed while it was
    /// waiting for the gate.
    async fn load(&self, share_id: &ShareId, force: bool) -> Result<()> {
        let gate = self.fetch_gate(share_id)?;
        let observed = gate.completed.load(Ordering::SeqCst);
        let _guard = gate.lock.lock().await;

        if gate.completed.load(Ordering::SeqCst) != observed
            || (!force && self.cached_latest(share_id).is_some())
        {
            return Ok(());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let chain = match self.fetch_and_unlock(share_id).await {
            Err(VaultSyncError::Crypto(CryptoError::MissingPassphrase { rotation, .. })) => {
                warn!(
                    share_id = %share_id,
                    rotation,
                    "Key passphrase did not unwrap; refetching key chain once"
                );
                self.fetch_and_unlock(share_id).await?
            }
            other => other?,
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(share_id = %share_id, "Discarding key chain fetched before wipe");
            return Err(VaultSyncError::Cancelled);
        }

        if let Ok(mut chains) = self.chains.write() {
            chains.insert(share_id.clone(), chain);
        }
        if let Ok(mut missing) = self.missing.lock() {
            missing.remove(share_id);
        }
        gate.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_and_unlock(&self, share_id: &ShareId) -> Result<Chain> {
        let encrypted = self.remote.fetch_key_chain(share_id).await?;
        let mut chain = Chain::new();
        for entry in &encrypted {
            let unlocked = KeyChainEntry::unlock(entry, self.keyring.as_ref())?;
            chain.insert(unlocked.rotation, Arc::new(unlocked));
        }
        debug!(share_id = %share_id, rotations = chain.len(), "Unlocked key chain");
        Ok(chain)
    }
}
