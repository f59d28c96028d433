//! Item content codec.
//!
//! Two layers of encryption protect an item:
//! - server layer: protobuf-encoded content sealed under the vault's item key
//!   (`itemcontent` associated data). This is what the server stores.
//! - local layer: the serialized server revision sealed again under the
//!   device key before it touches disk.

use crate::crypto::cipher::tag;
use crate::crypto::{open_base64, seal_base64, CryptoError};
use crate::device_key::SymmetricKeyProvider;
use crate::keys::KeyChainEntry;
use crate::models::{ItemId, ItemRevision, ShareId, SymmetricallyEncryptedItem};
use crate::Result;
use prost::Message;
use std::sync::Arc;

/// Content format written by this version.
pub const CONTENT_FORMAT_VERSION: u32 = 1;

/// Decrypted item content.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ItemContent {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub note: String,
    #[prost(string, tag = "3")]
    pub item_uuid: String,
    #[prost(oneof = "item_content::Data", tags = "4, 5")]
    pub data: Option<item_content::Data>,
    #[prost(message, repeated, tag = "6")]
    pub extra_fields: Vec<ExtraField>,
}

pub mod item_content {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(message, tag = "4")]
        Login(super::Login),
        #[prost(message, tag = "5")]
        Note(super::Note),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Login {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
    #[prost(string, repeated, tag = "3")]
    pub urls: Vec<String>,
    #[prost(string, tag = "4")]
    pub totp_uri: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Note {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtraField {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Decrypted vault display metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultContent {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
}

/// Server-layer ciphertext together with what is needed to decrypt it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedContent {
    pub content: String,
    pub key_rotation: i64,
    pub content_format_version: u32,
}

/// Encrypts and decrypts item content at both layers.
pub struct ItemCryptoCodec {
    device_key: Arc<SymmetricKeyProvider>,
}

impl ItemCryptoCodec {
    pub fn new(device_key: Arc<SymmetricKeyProvider>) -> Self {
        Self { device_key }
    }

    /// Seal `content` under the item key of `keys`.
    pub fn encrypt(&self, content: &ItemContent, keys: &KeyChainEntry) -> Result<EncryptedContent> {
        let encoded = content.encode_to_vec();
        Ok(EncryptedContent {
            content: seal_base64(&keys.item_key, &encoded, tag::ITEM_CONTENT)?,
            key_rotation: keys.rotation,
            content_format_version: CONTENT_FORMAT_VERSION,
        })
    }

    /// Open server-layer ciphertext.
    ///
    /// `expected_rotation` is the rotation recorded on the item. It must match
    /// the rotation of `keys`, otherwise [`CryptoError::UnmatchedKeyRotation`]
    /// is returned without attempting decryption.
    pub fn decrypt(
        &self,
        ciphertext: &str,
        keys: &KeyChainEntry,
        expected_rotation: i64,
    ) -> Result<ItemContent> {
        if keys.rotation != expected_rotation {
            return Err(CryptoError::UnmatchedKeyRotation {
                expected: expected_rotation,
                actual: keys.rotation,
            }
            .into());
        }
        let plaintext = open_base64(&keys.item_key, ciphertext, tag::ITEM_CONTENT)?;
        ItemContent::decode(plaintext.as_slice())
            .map_err(|_| CryptoError::FailedToDecryptContent.into())
    }

    /// Open the content of a full revision.
    pub fn decrypt_item(&self, item: &ItemRevision, keys: &KeyChainEntry) -> Result<ItemContent> {
        if item.content_format_version > CONTENT_FORMAT_VERSION {
            return Err(CryptoError::UnsupportedContentFormat(item.content_format_version).into());
        }
        self.decrypt(&item.content, keys, item.key_rotation)
    }

    pub fn encrypt_vault_content(
        &self,
        content: &VaultContent,
        keys: &KeyChainEntry,
    ) -> Result<EncryptedContent> {
        Ok(EncryptedContent {
            content: seal_base64(&keys.vault_key, &content.encode_to_vec(), tag::VAULT_CONTENT)?,
            key_rotation: keys.rotation,
            content_format_version: CONTENT_FORMAT_VERSION,
        })
    }

    pub fn decrypt_vault_content(
        &self,
        ciphertext: &str,
        keys: &KeyChainEntry,
        expected_rotation: i64,
    ) -> Result<VaultContent> {
        if keys.rotation != expected_rotation {
            return Err(CryptoError::UnmatchedKeyRotation {
                expected: expected_rotation,
                actual: keys.rotation,
            }
            .into());
        }
        let plaintext = open_base64(&keys.vault_key, ciphertext, tag::VAULT_CONTENT)?;
        VaultContent::decode(plaintext.as_slice())
            .map_err(|_| CryptoError::FailedToDecryptContent.into())
    }

    /// Wrap a server revision for the local cache.
    pub async fn symmetrically_encrypt(
        &self,
        share_id: &ShareId,
        item: &ItemRevision,
        pending: bool,
    ) -> Result<SymmetricallyEncryptedItem> {
        let serialized = serde_json::to_vec(item)
            .map_err(|e| crate::VaultSyncError::Serialization(e.to_string()))?;
        let key = self.device_key.get_or_create_key().await?;
        let aad = local_record_aad(share_id, &item.item_id);
        Ok(SymmetricallyEncryptedItem {
            share_id: share_id.clone(),
            item_id: item.item_id.clone(),
            revision: item.revision,
            key_rotation: item.key_rotation,
            state: item.state,
            modify_time: item.modify_time,
            last_use_time: item.last_use_time,
            pending,
            encrypted_revision: seal_base64(&key, &serialized, &aad)?,
        })
    }

    /// Unwrap a cached record. A record moved to another share or item id
    /// does not open.
    pub async fn symmetrically_decrypt(
        &self,
        record: &SymmetricallyEncryptedItem,
    ) -> Result<ItemRevision> {
        let key = self.device_key.get_or_create_key().await?;
        let aad = local_record_aad(&record.share_id, &record.item_id);
        let serialized = open_base64(&key, &record.encrypted_revision, &aad)?;
        serde_json::from_slice(&serialized).map_err(|_| CryptoError::FailedToDecryptContent.into())
    }

    /// Seal arbitrary local bookkeeping (queued mutations) under the device key.
    pub async fn seal_local(&self, bytes: &[u8]) -> Result<String> {
        let key = self.device_key.get_or_create_key().await?;
        Ok(seal_base64(&key, bytes, tag::LOCAL_RECORD)?)
    }

    pub async fn open_local(&self, sealed: &str) -> Result<Vec<u8>> {
        let key = self.device_key.get_or_create_key().await?;
        Ok(open_base64(&key, sealed, tag::LOCAL_RECORD)?)
    }
}

fn local_record_aad(share_id: &ShareId, item_id: &ItemId) -> Vec<u8> {
    [
        tag::LOCAL_RECORD,
        b":",
        share_id.as_str().as_bytes(),
        b":",
        item_id.as_str().as_bytes(),
    ]
    .concat()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::AddressKey;
    use crate::models::ItemState;
    use crate::secret_store::MemorySecretStore;
    use crate::VaultSyncError;

    fn codec() -> ItemCryptoCodec {
        let store = Arc::new(MemorySecretStore::new());
        ItemCryptoCodec::new(Arc::new(SymmetricKeyProvider::new(store)))
    }

    fn keys(rotation: i64) -> KeyChainEntry {
        KeyChainEntry::generate("vault", rotation, &AddressKey::generate("a"), 0)
            .unwrap()
            .0
    }

    fn login(name: &str) -> ItemContent {
        ItemContent {
            name: name.to_string(),
            note: "note".to_string(),
            item_uuid: "uuid".to_string(),
            data: Some(item_content::Data::Login(Login {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
                urls: vec!["https://example.com".to_string()],
                totp_uri: String::new(),
            })),
            extra_fields: vec![],
        }
    }

    fn revision(encrypted: &EncryptedContent) -> ItemRevision {
        ItemRevision {
            item_id: ItemId::from("item-1"),
            revision: 1,
            content_format_version: encrypted.content_format_version,
            key_rotation: encrypted.key_rotation,
            content: encrypted.content.clone(),
            state: ItemState::Active,
            create_time: 10,
            modify_time: 10,
            last_use_time: None,
            revision_time: 10,
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let codec = codec();
        let keys = keys(2);
        let encrypted = codec.encrypt(&login("Bank"), &keys).unwrap();
        assert_eq!(encrypted.key_rotation, 2);

        let item = revision(&encrypted);
        assert_eq!(codec.decrypt_item(&item, &keys).unwrap(), login("Bank"));
    }

    #[test]
    fn rotation_mismatch_is_checked_first() {
        let codec = codec();
        let encrypted = codec.encrypt(&login("Bank"), &keys(1)).unwrap();
        let err = codec.decrypt(&encrypted.content, &keys(2), 1).unwrap_err();
        assert!(matches!(
            err,
            VaultSyncError::Crypto(CryptoError::UnmatchedKeyRotation { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn wrong_item_key_fails_to_decrypt() {
        let codec = codec();
        let encrypted = codec.encrypt(&login("Bank"), &keys(1)).unwrap();
        let err = codec.decrypt(&encrypted.content, &keys(1), 1).unwrap_err();
        assert!(matches!(
            err,
            VaultSyncError::Crypto(CryptoError::FailedToDecryptContent)
        ));
    }

    #[test]
    fn vault_content_does_not_open_as_item_content() {
        let codec = codec();
        let keys = keys(1);
        let vault = codec
            .encrypt_vault_content(
                &VaultContent {
                    name: "Personal".to_string(),
                    description: String::new(),
                },
                &keys,
            )
            .unwrap();
        assert!(codec.decrypt(&vault.content, &keys, 1).is_err());
        assert_eq!(
            codec.decrypt_vault_content(&vault.content, &keys, 1).unwrap().name,
            "Personal"
        );
    }

    #[test]
    fn newer_content_format_is_rejected() {
        let codec = codec();
        let keys = keys(1);
        let mut item = revision(&codec.encrypt(&login("x"), &keys).unwrap());
        item.content_format_version = CONTENT_FORMAT_VERSION + 1;
        assert!(matches!(
            codec.decrypt_item(&item, &keys).unwrap_err(),
            VaultSyncError::Crypto(CryptoError::UnsupportedContentFormat(_))
        ));
    }

    #[test]
    fn default_content_roundtrips() {
        let codec = codec();
        let keys = keys(1);
        let encrypted = codec.encrypt(&ItemContent::default(), &keys).unwrap();
        assert_eq!(
            codec.decrypt(&encrypted.content, &keys, 1).unwrap(),
            ItemContent::default()
        );
    }

    #[tokio::test]
    async fn local_layer_roundtrip_keeps_metadata() {
        let codec = codec();
        let keys = keys(1);
        let item = revision(&codec.encrypt(&login("Bank"), &keys).unwrap());
        let share = ShareId::from("share-1");

        let record = codec.symmetrically_encrypt(&share, &item, true).await.unwrap();
        assert!(record.pending);
        assert_eq!(record.revision, 1);
        assert!(!record.encrypted_revision.contains(&item.content));

        assert_eq!(codec.symmetrically_decrypt(&record).await.unwrap(), item);
    }

    #[tokio::test]
    async fn local_record_is_bound_to_its_location() {
        let codec = codec();
        let keys = keys(1);
        let item = revision(&codec.encrypt(&login("Bank"), &keys).unwrap());
        let mut record = codec
            .symmetrically_encrypt(&ShareId::from("share-1"), &item, false)
            .await
            .unwrap();
        record.share_id = ShareId::from("share-2");
        assert!(codec.symmetrically_decrypt(&record).await.is_err());
    }
}
