//! Vault lifecycle: creation with a first key rotation, listing with
//! decrypted display metadata, renaming and deletion.

use crate::cache::LocalCache;
use crate::codec::VaultContent;
use crate::keys::{KeyChainEntry, KeyHierarchyManager};
use crate::models::{Share, ShareId, VaultContentRequest};
use crate::remote::{CreateVaultRequest, RemoteSyncClient};
use crate::session::UserKeyring;
use crate::sync::SyncReconciler;
use crate::{Result, VaultSyncError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A vault as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultSummary {
    pub share_id: ShareId,
    pub vault_id: String,
    pub name: String,
    pub description: String,
    pub owner: bool,
    pub key_rotation: i64,
    pub create_time: i64,
}

/// Creates, lists, updates and deletes vaults.
pub struct VaultService {
    remote: Arc<RemoteSyncClient>,
    keys: Arc<KeyHierarchyManager>,
    keyring: Arc<dyn UserKeyring>,
    cache: LocalCache,
    reconciler: Option<SyncReconciler>,
}

impl VaultService {
    pub fn new(
        remote: Arc<RemoteSyncClient>,
        keys: Arc<KeyHierarchyManager>,
        keyring: Arc<dyn UserKeyring>,
        cache: LocalCache,
    ) -> Self {
        Self {
            remote,
            keys,
            keyring,
            cache,
            reconciler: None,
        }
    }

    /// Route local purges of deleted vaults through `reconciler`, so a pass
    /// in flight for the vault is cancelled first.
    pub fn with_reconciler(mut self, reconciler: SyncReconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Create a vault signed by the primary address key. The new key chain
    /// is cached right away; nothing is fetched back from the server.
    pub async fn create_vault(&self, name: &str, description: &str) -> Result<VaultSummary> {
        let content = validated(name, description)?;
        let address = self
            .keyring
            .primary()
            .ok_or_else(|| VaultSyncError::KeyUnavailable("no address key to sign with".to_string()))?;

        let vault_id = uuid::Uuid::new_v4().to_string();
        let (entry, encrypted_keys) =
            KeyChainEntry::generate(&vault_id, 1, &address, Utc::now().timestamp())?;
        let encrypted = self.cache.codec().encrypt_vault_content(&content, &entry)?;

        let share = self
            .remote
            .create_vault(&CreateVaultRequest {
                vault_id: vault_id.clone(),
                content: encrypted.content,
                content_format_version: encrypted.content_format_version,
                keys: encrypted_keys,
            })
            .await?;
        self.keys.insert(&share.share_id, entry);
        self.cache.put_share(&share).await?;

        info!(share_id = %share.share_id, vault_id = %vault_id, "Created vault");
        Ok(summary(&share, content))
    }

    /// Every vault the user can access. Vaults whose metadata does not
    /// decrypt are logged and left out.
    pub async fn list_vaults(&self) -> Result<Vec<VaultSummary>> {
        let shares = self.remote.list_shares().await?;
        let mut vaults = Vec::with_capacity(shares.len());
        for share in shares {
            match self.open_content(&share).await {
                Ok(content) => vaults.push(summary(&share, content)),
                Err(e) => {
                    warn!(share_id = %share.share_id, error = %e, "Skipping vault whose metadata does not decrypt");
                }
            }
        }
        Ok(vaults)
    }

    /// Replace the display metadata, encrypted with the active rotation.
    pub async fn update_vault(&self, share_id: &ShareId, name: &str, description: &str) -> Result<VaultSummary> {
        let content = validated(name, description)?;
        let keys = self.keys.active_keys(share_id).await?;
        let encrypted = self.cache.codec().encrypt_vault_content(&content, &keys)?;
        let share = self
            .remote
            .update_vault(
                share_id,
                &VaultContentRequest {
                    content: encrypted.content,
                    content_format_version: encrypted.content_format_version,
                    key_rotation: encrypted.key_rotation,
                },
            )
            .await?;
        self.cache.put_share(&share).await?;
        info!(share_id = %share_id, "Updated vault");
        Ok(summary(&share, content))
    }

    /// Delete the vault on the server, then drop its items, cursor, queued
    /// changes and keys locally.
    pub async fn delete_vault(&self, share_id: &ShareId) -> Result<()> {
        self.remote.delete_vault(share_id).await?;
        match &self.reconciler {
            Some(reconciler) => reconciler.remove_share(share_id).await?,
            None => {
                self.cache.remove_share(share_id).await?;
                self.keys.forget(share_id);
            }
        }
        info!(share_id = %share_id, "Deleted vault");
        Ok(())
    }

    async fn open_content(&self, share: &Share) -> Result<VaultContent> {
        let Some(ciphertext) = &share.content else {
            return Ok(VaultContent::default());
        };
        let rotation = share.content_key_rotation.unwrap_or(share.key_rotation);
        let keys = self.keys.keys_for_rotation(&share.share_id, rotation).await?;
        self.cache
            .codec()
            .decrypt_vault_content(ciphertext, &keys, rotation)
    }
}

fn validated(name: &str, description: &str) -> Result<VaultContent> {
    let name = name.trim();
    if name.is_empty() {
        return Err(VaultSyncError::InvalidInput("vault name must not be empty".to_string()));
    }
    Ok(VaultContent {
        name: name.to_string(),
        description: description.to_string(),
    })
}

fn summary(share: &Share, content: VaultContent) -> VaultSummary {
    VaultSummary {
        share_id: share.share_id.clone(),
        vault_id: share.vault_id.clone(),
        name: content.name,
        description: content.description,
        owner: share.owner,
        key_rotation: share.key_rotation,
        create_time: share.create_time,
    }
}
