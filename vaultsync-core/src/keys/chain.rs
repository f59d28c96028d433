//! Key chain entries: generation, signing and unlocking.

use crate::crypto::cipher::{tag, KEY_LEN};
use crate::crypto::{
    derive_key, fingerprint, open_base64, seal_base64, sign_detached, verify_detached, CryptoError,
    SymmetricKey,
};
use crate::session::UserKeyring;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

const ADDRESS_WRAP_INFO: &[u8] = b"vaultsync-address-wrap-v1";
const SIGNING_WRAP_INFO: &[u8] = b"vaultsync-signing-wrap-v1";
const PASSPHRASE_KEY_INFO: &[u8] = b"vaultsync-key-material-v1";

/// A user address key. Signs and wraps the signing key of every chain entry.
pub struct AddressKey {
    key_id: String,
    secret: SigningKey,
}

impl AddressKey {
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(key_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            secret: SigningKey::from_bytes(seed),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn seed(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.secret.verifying_key()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.verifying_key())
    }

    fn wrap_key(&self) -> Result<SymmetricKey, CryptoError> {
        derive_key(self.secret.as_bytes(), ADDRESS_WRAP_INFO)
    }
}

impl fmt::Debug for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressKey")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// One wrapped, signed key as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyBlob {
    /// Key material sealed under a key derived from the passphrase.
    pub key: String,
    /// Passphrase sealed under the parent key.
    pub passphrase: String,
    /// Issuer signature over vault id, rotation, purpose and `key`.
    pub signature: String,
    /// Hex SHA-256 of the issuer's verifying key.
    pub issuer_fingerprint: String,
}

/// One rotation of a vault's key chain, as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyChainEntry {
    pub vault_id: String,
    pub rotation: i64,
    pub signing_key: EncryptedKeyBlob,
    pub vault_key: EncryptedKeyBlob,
    pub item_key: EncryptedKeyBlob,
    pub create_time: i64,
}

/// A decrypted, verified chain entry. Key material is zeroized on drop.
pub struct KeyChainEntry {
    pub vault_id: String,
    pub rotation: i64,
    pub signing_key: SigningKey,
    pub vault_key: SymmetricKey,
    pub item_key: SymmetricKey,
}

impl fmt::Debug for KeyChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyChainEntry")
            .field("vault_id", &self.vault_id)
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

impl KeyChainEntry {
    /// Create a fresh rotation signed by `address`.
    pub fn generate(
        vault_id: &str,
        rotation: i64,
        address: &AddressKey,
        create_time: i64,
    ) -> Result<(Self, EncryptedKeyChainEntry), CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let vault_key = SymmetricKey::generate();
        let item_key = SymmetricKey::generate();

        let signing_wrap = derive_key(signing_key.as_bytes(), SIGNING_WRAP_INFO)?;
        let encrypted = EncryptedKeyChainEntry {
            vault_id: vault_id.to_string(),
            rotation,
            signing_key: wrap_key(
                vault_id,
                rotation,
                tag::SIGNING_KEY,
                signing_key.as_bytes(),
                &address.wrap_key()?,
                &address.secret,
            )?,
            vault_key: wrap_key(
                vault_id,
                rotation,
                tag::VAULT_KEY,
                vault_key.as_bytes(),
                &signing_wrap,
                &signing_key,
            )?,
            item_key: wrap_key(
                vault_id,
                rotation,
                tag::ITEM_KEY,
                item_key.as_bytes(),
                &vault_key,
                &signing_key,
            )?,
            create_time,
        };

        let entry = Self {
            vault_id: vault_id.to_string(),
            rotation,
            signing_key,
            vault_key,
            item_key,
        };
        Ok((entry, encrypted))
    }

    /// Verify and decrypt a chain entry.
    ///
    /// Every signature is checked before the key it covers is unwrapped. A
    /// passphrase that does not open under its parent key is reported as
    /// [`CryptoError::MissingPassphrase`] so the caller can refetch the chain.
    pub fn unlock(
        encrypted: &EncryptedKeyChainEntry,
        keyring: &dyn UserKeyring,
    ) -> Result<Self, CryptoError> {
        let vault_id = encrypted.vault_id.as_str();
        let rotation = encrypted.rotation;

        let address = keyring
            .by_fingerprint(&encrypted.signing_key.issuer_fingerprint)
            .ok_or_else(|| {
                CryptoError::FailedToVerifySignature(format!(
                    "no address key matches issuer {}",
                    encrypted.signing_key.issuer_fingerprint
                ))
            })?;

        let mut signing_seed = unwrap_key(
            vault_id,
            rotation,
            tag::SIGNING_KEY,
            &encrypted.signing_key,
            &address.wrap_key()?,
            &address.verifying_key(),
        )?;
        let signing_key = SigningKey::from_bytes(&signing_seed);
        signing_seed.zeroize();
        let signing_verifier = signing_key.verifying_key();
        let signing_wrap = derive_key(signing_key.as_bytes(), SIGNING_WRAP_INFO)?;

        let mut vault_bytes = unwrap_key(
            vault_id,
            rotation,
            tag::VAULT_KEY,
            &encrypted.vault_key,
            &signing_wrap,
            &signing_verifier,
        )?;
        let vault_key = SymmetricKey::from_bytes(vault_bytes);
        vault_bytes.zeroize();

        let mut item_bytes = unwrap_key(
            vault_id,
            rotation,
            tag::ITEM_KEY,
            &encrypted.item_key,
            &vault_key,
            &signing_verifier,
        )?;
        let item_key = SymmetricKey::from_bytes(item_bytes);
        item_bytes.zeroize();

        Ok(Self {
            vault_id: vault_id.to_string(),
            rotation,
            signing_key,
            vault_key,
            item_key,
        })
    }
}

fn signature_payload(vault_id: &str, rotation: i64, purpose: &[u8], sealed_key: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(vault_id.len() + 8 + purpose.len() + sealed_key.len() + 2);
    payload.extend_from_slice(vault_id.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&rotation.to_be_bytes());
    payload.extend_from_slice(purpose);
    payload.push(0);
    payload.extend_from_slice(sealed_key.as_bytes());
    payload
}

fn passphrase_aad(purpose: &[u8]) -> Vec<u8> {
    [tag::KEY_PASSPHRASE, b":", purpose].concat()
}

fn wrap_key(
    vault_id: &str,
    rotation: i64,
    purpose: &[u8],
    material: &[u8; KEY_LEN],
    parent: &SymmetricKey,
    issuer: &SigningKey,
) -> Result<EncryptedKeyBlob, CryptoError> {
    let mut passphrase = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut passphrase);

    let material_key = derive_key(&passphrase, PASSPHRASE_KEY_INFO)?;
    let key = seal_base64(&material_key, material, purpose)?;
    let sealed_passphrase = seal_base64(parent, &passphrase, &passphrase_aad(purpose));
    passphrase.zeroize();

    let signature = sign_detached(issuer, &signature_payload(vault_id, rotation, purpose, &key));
    Ok(EncryptedKeyBlob {
        key,
        passphrase: sealed_passphrase?,
        signature,
        issuer_fingerprint: fingerprint(&issuer.verifying_key()),
    })
}

fn unwrap_key(
    vault_id: &str,
    rotation: i64,
    purpose: &[u8],
    blob: &EncryptedKeyBlob,
    parent: &SymmetricKey,
    issuer: &VerifyingKey,
) -> Result<[u8; KEY_LEN], CryptoError> {
    verify_detached(
        issuer,
        &blob.issuer_fingerprint,
        &signature_payload(vault_id, rotation, purpose, &blob.key),
        &blob.signature,
    )?;

    let mut passphrase = open_base64(parent, &blob.passphrase, &passphrase_aad(purpose)).map_err(
        |_| CryptoError::MissingPassphrase {
            share_id: vault_id.to_string(),
            rotation,
        },
    )?;
    let material_key = derive_key(&passphrase, PASSPHRASE_KEY_INFO);
    passphrase.zeroize();

    let mut material = open_base64(&material_key?, &blob.key, purpose)?;
    let key: Result<[u8; KEY_LEN], _> = material.as_slice().try_into();
    let got = material.len();
    material.zeroize();
    key.map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LEN,
        got,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticUserKeyring;

    fn keyring_with(address: AddressKey) -> StaticUserKeyring {
        StaticUserKeyring::new(vec![address])
    }

    #[test]
    fn generated_entry_unlocks_to_same_keys() {
        let address = AddressKey::generate("addr");
        let (entry, encrypted) = KeyChainEntry::generate("vault-1", 1, &address, 100).unwrap();
        let keyring = keyring_with(address);

        let unlocked = KeyChainEntry::unlock(&encrypted, &keyring).unwrap();
        assert_eq!(unlocked.rotation, 1);
        assert_eq!(unlocked.vault_key, entry.vault_key);
        assert_eq!(unlocked.item_key, entry.item_key);
        assert_eq!(unlocked.signing_key.to_bytes(), entry.signing_key.to_bytes());
    }

    #[test]
    fn unknown_issuer_is_rejected() {
        let (_, encrypted) =
            KeyChainEntry::generate("vault-1", 1, &AddressKey::generate("a"), 0).unwrap();
        let keyring = keyring_with(AddressKey::generate("b"));
        let err = KeyChainEntry::unlock(&encrypted, &keyring).unwrap_err();
        assert!(matches!(err, CryptoError::FailedToVerifySignature(_)));
    }

    #[test]
    fn relabeled_rotation_fails_signature() {
        let address = AddressKey::generate("addr");
        let (_, mut encrypted) = KeyChainEntry::generate("vault-1", 1, &address, 0).unwrap();
        encrypted.rotation = 2;
        let err = KeyChainEntry::unlock(&encrypted, &keyring_with(address)).unwrap_err();
        assert!(matches!(err, CryptoError::FailedToVerifySignature(_)));
    }

    #[test]
    fn swapped_item_key_fails_signature() {
        let address = AddressKey::generate("addr");
        let (_, mut first) = KeyChainEntry::generate("vault-1", 1, &address, 0).unwrap();
        let (_, second) = KeyChainEntry::generate("vault-1", 1, &address, 0).unwrap();
        first.item_key = second.item_key;
        let err = KeyChainEntry::unlock(&first, &keyring_with(address)).unwrap_err();
        assert!(matches!(err, CryptoError::FailedToVerifySignature(_)));
    }

    #[test]
    fn undecryptable_passphrase_is_missing_passphrase() {
        let address = AddressKey::generate("addr");
        let (_, mut encrypted) = KeyChainEntry::generate("vault-1", 3, &address, 0).unwrap();
        let (_, other) = KeyChainEntry::generate("vault-1", 3, &address, 0).unwrap();
        // signature covers only the sealed key, so a foreign passphrase passes verification
        encrypted.vault_key.passphrase = other.vault_key.passphrase;
        let err = KeyChainEntry::unlock(&encrypted, &keyring_with(address)).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::MissingPassphrase { rotation: 3, .. }
        ));
    }

    #[test]
    fn debug_hides_key_material() {
        let address = AddressKey::generate("addr");
        let (entry, _) = KeyChainEntry::generate("vault-1", 1, &address, 0).unwrap();
        let rendered = format!("{:?}", entry);
        assert!(rendered.contains("rotation: 1"));
        assert!(!rendered.contains("item_key"));
    }
}
