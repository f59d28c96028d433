//! Secret storage for device keys, session credentials and address keys.
//!
//! [`SecretStore`] is an async byte-slot store. [`TypedSecret`] layers a
//! typed accessor over one slot with serde_json (de)serialization.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use zeroize::Zeroize;

/// Errors raised by secret store backends
#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("Secret store backend error: {0}")]
    Backend(String),

    #[error("Secret encoding error: {0}")]
    Encoding(String),

    #[error("Secret store task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SecretStoreError>;

/// Keyed storage for small secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local secret store. Contents vanish with the process.
#[derive(Default)]
pub struct MemorySecretStore {
    slots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.slots
            .lock()
            .map_err(|_| SecretStoreError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if let Some(mut old) = self.lock()?.insert(key.to_string(), value.to_vec()) {
            old.zeroize();
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if let Some(mut old) = self.lock()?.remove(key) {
            old.zeroize();
        }
        Ok(())
    }
}

/// Secret store backed by the OS keyring (Keychain, Credential Manager, Secret Service).
///
/// Values are stored base64-encoded to keep them UTF-8 safe across backends.
/// Keyring calls block, so they run on the blocking pool.
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn with_entry<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry) -> Result<T> + Send + 'static,
    {
        let service = self.service.clone();
        let user = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &user).map_err(|e| {
                SecretStoreError::Backend(format!("Failed to initialize keyring entry: {}", e))
            })?;
            f(entry)
        })
        .await
        .map_err(|e| SecretStoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SecretStore for KeyringSecretStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(mut encoded) => {
                let decoded = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| SecretStoreError::Encoding(e.to_string()));
                encoded.zeroize();
                decoded.map(Some)
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SecretStoreError::Backend(format!(
                "Failed to read keyring secret: {}",
                e
            ))),
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut encoded = STANDARD.encode(value);
        self.with_entry(key, move |entry| {
            let result = entry.set_password(&encoded).map_err(|e| {
                SecretStoreError::Backend(format!("Failed to store keyring secret: {}", e))
            });
            encoded.zeroize();
            result
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.with_entry(key, |entry| match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretStoreError::Backend(format!(
                "Failed to delete keyring secret: {}",
                e
            ))),
        })
        .await
    }
}

/// Typed accessor over one slot of a [`SecretStore`].
pub struct TypedSecret<T> {
    store: Arc<dyn SecretStore>,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedSecret<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedSecret<T> {
    pub fn new(store: Arc<dyn SecretStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn load(&self) -> Result<Option<T>> {
        let Some(mut bytes) = self.store.get(&self.key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| SecretStoreError::Encoding(format!("{}: {}", self.key, e)));
        bytes.zeroize();
        value.map(Some)
    }

    pub async fn store(&self, value: &T) -> Result<()> {
        let mut bytes = serde_json::to_vec(value)
            .map_err(|e| SecretStoreError::Encoding(format!("{}: {}", self.key, e)))?;
        let result = self.store.set(&self.key, &bytes).await;
        bytes.zeroize();
        result
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(&self.key).await
    }
}
