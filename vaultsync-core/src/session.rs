//! Session seam: credentials, invalidation signal and the user's address keys.
//!
//! Authentication itself happens elsewhere. The engine only needs to read the
//! current credentials, learn when the server rejects them, and find the
//! address keys that sign the user's key chains.

use crate::keys::AddressKey;
use crate::secret_store::TypedSecret;
use crate::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SESSION_SLOT: &str = "session-credentials";
pub const ADDRESS_KEY_SLOT: &str = "address-key";

/// Credentials attached to every API request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionCredentials {
    pub uid: String,
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("uid", &self.uid)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Invalidated,
}

/// Tracks the current session and broadcasts invalidation.
pub struct SessionMonitor {
    state: watch::Sender<SessionState>,
    credentials: RwLock<Option<SessionCredentials>>,
    slot: Option<TypedSecret<SessionCredentials>>,
}

impl SessionMonitor {
    /// A monitor holding credentials in memory only.
    pub fn new(credentials: Option<SessionCredentials>) -> Self {
        let initial = if credentials.is_some() {
            SessionState::Active
        } else {
            SessionState::Invalidated
        };
        let (state, _) = watch::channel(initial);
        Self {
            state,
            credentials: RwLock::new(credentials),
            slot: None,
        }
    }

    /// Load credentials from their secret store slot.
    pub async fn load(slot: TypedSecret<SessionCredentials>) -> Result<Self> {
        let credentials = slot.load().await?;
        let mut monitor = Self::new(credentials);
        monitor.slot = Some(slot);
        Ok(monitor)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn credentials(&self) -> Option<SessionCredentials> {
        match self.credentials.read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    /// Mark the session as rejected by the server. Sync pauses until restored.
    pub fn invalidate(&self) {
        if self.state() == SessionState::Active {
            warn!("Session invalidated; sync paused until credentials are restored");
        }
        self.state.send_replace(SessionState::Invalidated);
    }

    /// Install fresh credentials and resume.
    pub async fn restore(&self, credentials: SessionCredentials) -> Result<()> {
        if let Some(slot) = &self.slot {
            slot.store(&credentials).await?;
        }
        if let Ok(mut guard) = self.credentials.write() {
            *guard = Some(credentials);
        }
        self.state.send_replace(SessionState::Active);
        info!("Session restored");
        Ok(())
    }

    /// Drop credentials from memory and storage.
    pub async fn clear(&self) -> Result<()> {
        if let Some(slot) = &self.slot {
            slot.clear().await?;
        }
        if let Ok(mut guard) = self.credentials.write() {
            *guard = None;
        }
        self.state.send_replace(SessionState::Invalidated);
        Ok(())
    }
}

/// Supplies the user's address keys.
pub trait UserKeyring: Send + Sync {
    fn address_keys(&self) -> Vec<Arc<AddressKey>>;

    /// Key used to sign newly created key chains.
    fn primary(&self) -> Option<Arc<AddressKey>> {
        self.address_keys().into_iter().next()
    }

    fn by_fingerprint(&self, fingerprint: &str) -> Option<Arc<AddressKey>> {
        self.address_keys()
            .into_iter()
            .find(|key| key.fingerprint() == fingerprint)
    }
}

/// Address keys held in memory; the first one is primary.
pub struct StaticUserKeyring {
    keys: Vec<Arc<AddressKey>>,
}

impl StaticUserKeyring {
    pub fn new(keys: Vec<AddressKey>) -> Self {
        Self {
            keys: keys.into_iter().map(Arc::new).collect(),
        }
    }
}

impl UserKeyring for StaticUserKeyring {
    fn address_keys(&self) -> Vec<Arc<AddressKey>> {
        self.keys.clone()
    }
}

/// Persisted form of an address key.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredAddressKey {
    pub key_id: String,
    /// base64 Ed25519 seed
    pub seed: String,
}

impl StoredAddressKey {
    pub fn from_key(key: &AddressKey) -> Self {
        Self {
            key_id: key.key_id().to_string(),
            seed: STANDARD.encode(key.seed()),
        }
    }

    pub fn to_key(&self) -> Result<AddressKey> {
        let mut bytes = STANDARD
            .decode(&self.seed)
            .map_err(|e| crate::VaultSyncError::Serialization(format!("address key seed: {}", e)))?;
        let seed: std::result::Result<[u8; 32], _> = bytes.as_slice().try_into();
        bytes.zeroize();
        let mut seed = seed.map_err(|_| {
            crate::VaultSyncError::Serialization("address key seed must be 32 bytes".to_string())
        })?;
        let key = AddressKey::from_seed(self.key_id.clone(), &seed);
        seed.zeroize();
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::{MemorySecretStore, SecretStore};

    fn credentials() -> SessionCredentials {
        SessionCredentials {
            uid: "uid-1".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
        }
    }

    #[test]
    fn debug_redacts_tokens() {
        let rendered = format!("{:?}", credentials());
        assert!(rendered.contains("uid-1"));
        assert!(!rendered.contains("access\""));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn invalidate_and_restore_notify_subscribers() {
        let monitor = SessionMonitor::new(Some(credentials()));
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow(), SessionState::Active);

        monitor.invalidate();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Invalidated);

        monitor.restore(credentials()).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Active);
    }

    #[tokio::test]
    async fn load_without_credentials_starts_invalidated() {
        let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let monitor = SessionMonitor::load(TypedSecret::new(store.clone(), SESSION_SLOT))
            .await
            .unwrap();
        assert_eq!(monitor.state(), SessionState::Invalidated);

        monitor.restore(credentials()).await.unwrap();
        let reloaded = SessionMonitor::load(TypedSecret::new(store, SESSION_SLOT))
            .await
            .unwrap();
        assert_eq!(reloaded.credentials(), Some(credentials()));
    }

    #[test]
    fn keyring_finds_keys_by_fingerprint() {
        let first = AddressKey::generate("a1");
        let second = AddressKey::generate("a2");
        let fp = second.fingerprint();
        let keyring = StaticUserKeyring::new(vec![first, second]);

        assert_eq!(keyring.primary().unwrap().key_id(), "a1");
        assert_eq!(keyring.by_fingerprint(&fp).unwrap().key_id(), "a2");
        assert!(keyring.by_fingerprint("00").is_none());
    }

    #[test]
    fn stored_address_key_restores_same_key() {
        let key = AddressKey::generate("addr");
        let restored = StoredAddressKey::from_key(&key).to_key().unwrap();
        assert_eq!(restored.fingerprint(), key.fingerprint());
    }
}
