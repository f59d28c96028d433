//! Device-local symmetric key used to seal the local cache.
//!
//! The key is generated on first use and persisted in the secret store. It
//! never leaves the device and is never sent to the server. Losing it makes
//! every cached record undecryptable, which callers treat as an empty cache.

use crate::crypto::SymmetricKey;
use crate::secret_store::SecretStore;
use crate::{Result, VaultSyncError};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroize;

const DEVICE_KEY_SLOT: &str = "device-symmetric-key";

/// Provides the device key, creating it exactly once.
pub struct SymmetricKeyProvider {
    store: Arc<dyn SecretStore>,
    slot: String,
    cached: Mutex<Option<SymmetricKey>>,
}

impl SymmetricKeyProvider {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self::with_slot(store, DEVICE_KEY_SLOT)
    }

    pub fn with_slot(store: Arc<dyn SecretStore>, slot: impl Into<String>) -> Self {
        Self {
            store,
            slot: slot.into(),
            cached: Mutex::new(None),
        }
    }

    /// Return the device key, generating and persisting it if none exists.
    ///
    /// Concurrent callers serialize on the cache lock, so only one of them can
    /// observe an empty slot and create the key. A secret store failure is
    /// reported as [`VaultSyncError::KeyUnavailable`]; no key is invented in
    /// that case.
    pub async fn get_or_create_key(&self) -> Result<SymmetricKey> {
        let mut cached = self.cached.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let stored = self
            .store
            .get(&self.slot)
            .await
            .map_err(|e| VaultSyncError::KeyUnavailable(format!("read {}: {}", self.slot, e)))?;

        let key = match stored {
            Some(mut bytes) => {
                let key = SymmetricKey::from_slice(&bytes).map_err(|e| {
                    VaultSyncError::KeyUnavailable(format!("stored device key: {}", e))
                });
                bytes.zeroize();
                debug!("Loaded device key from secret store");
                key?
            }
            None => {
                let key = SymmetricKey::generate();
                self.store
                    .set(&self.slot, key.as_bytes())
                    .await
                    .map_err(|e| {
                        VaultSyncError::KeyUnavailable(format!("persist {}: {}", self.slot, e))
                    })?;
                info!("Generated new device key");
                key
            }
        };

        *cached = Some(key.clone());
        Ok(key)
    }

    /// Remove the device key from memory and the secret store.
    pub async fn wipe(&self) -> Result<()> {
        let mut cached = self.cached.lock().await;
        *cached = None;
        self.store
            .remove(&self.slot)
            .await
            .map_err(|e| VaultSyncError::KeyUnavailable(format!("remove {}: {}", self.slot, e)))?;
        info!("Device key wiped");
        Ok(())
    }
}
