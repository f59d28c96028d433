//! Vault Sync Core Library
//!
//! End-to-end encrypted synchronization of vaults and items between a remote
//! server and a local encrypted cache. The server only ever stores ciphertext;
//! keys are unwrapped on the client from a signed, rotating key hierarchy.

pub mod cache;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod device_key;
pub mod keys;
pub mod models;
pub mod platform;
pub mod remote;
pub mod secret_store;
pub mod session;
pub mod sync;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheError, LocalCache, LocalItemStore, SqliteItemStore, SyncMetadataStore};
pub use codec::{ItemContent, ItemCryptoCodec, VaultContent};
pub use config::{ConflictPolicy, SyncConfig};
pub use crypto::{CryptoError, SymmetricKey};
pub use device_key::SymmetricKeyProvider;
pub use keys::{AddressKey, EncryptedKeyChainEntry, KeyChainEntry, KeyHierarchyManager};
pub use models::{
    ItemId, ItemRevision, ItemState, LastUseItem, ModifiedItem, Share, ShareId,
    SymmetricallyEncryptedItem, SyncCursor,
};
pub use remote::{HttpRemoteApi, RemoteApi, RemoteError, RemoteSyncClient};
pub use secret_store::{KeyringSecretStore, MemorySecretStore, SecretStore, TypedSecret};
pub use session::{SessionCredentials, SessionMonitor, SessionState, StaticUserKeyring, UserKeyring};
pub use sync::{SyncEvent, SyncPhase, SyncReconciler};
pub use vault::{VaultService, VaultSummary};

use thiserror::Error;

/// Result type for sync engine operations
pub type Result<T> = std::result::Result<T, VaultSyncError>;

/// General error type for sync engine operations
#[derive(Error, Debug)]
pub enum VaultSyncError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Remote error: {0}")]
    Remote(#[from] remote::RemoteError),

    #[error("Cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("Secret store error: {0}")]
    SecretStore(#[from] secret_store::SecretStoreError),

    #[error("Local key unavailable: {0}")]
    KeyUnavailable(String),

    #[error(
        "Revision conflict on item {item_id} in share {share_id}: \
         base revision {base_revision}, remote revision {remote_revision}"
    )]
    RevisionConflict {
        share_id: models::ShareId,
        item_id: models::ItemId,
        base_revision: i64,
        remote_revision: i64,
    },

    #[error("Session is invalidated")]
    SessionInvalidated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl VaultSyncError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_transient())
    }
}
