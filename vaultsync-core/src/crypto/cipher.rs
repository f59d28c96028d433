//! AES-256-GCM sealing for keys, item content and local cache records.
//!
//! Wire format of every sealed blob is `nonce(12) || ciphertext || auth_tag(16)`.
//! Text fields carry the blob base64-encoded (standard alphabet, padded).
//! Every seal binds a purpose tag as associated data, so a blob sealed for one
//! purpose never opens under another even with the right key.

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroize;

/// Associated-data tags, one per sealing purpose.
pub mod tag {
    pub const ITEM_CONTENT: &[u8] = b"itemcontent";
    pub const ITEM_KEY: &[u8] = b"itemkey";
    pub const VAULT_CONTENT: &[u8] = b"vaultcontent";
    pub const VAULT_KEY: &[u8] = b"vaultkey";
    pub const SIGNING_KEY: &[u8] = b"signingkey";
    pub const KEY_PASSPHRASE: &[u8] = b"keypassphrase";
    pub const LOCAL_RECORD: &[u8] = b"localrecord";
}

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// A 256-bit symmetric key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    key: [u8; KEY_LEN],
}

impl SymmetricKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: bytes.len(),
        })?;
        Ok(Self { key })
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Derive a purpose-specific key from input keying material with HKDF-SHA256.
pub fn derive_key(ikm: &[u8], info: &[u8]) -> Result<SymmetricKey> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut key = [0u8; KEY_LEN];
    hkdf.expand(info, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
    let derived = SymmetricKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

/// Seal `plaintext` under `key`, binding `aad`.
///
/// Returns `nonce(12) || ciphertext || auth_tag(16)`. Empty plaintext is
/// allowed: an item with every field at its default encodes to zero bytes.
pub fn seal(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let nonce_bytes: [u8; NONCE_LEN] = nonce.into();

    let ciphertext_with_tag = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext_with_tag.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext_with_tag);
    Ok(result)
}

/// Open a blob produced by [`seal`].
///
/// Any failure (short blob, wrong key, wrong purpose, tampering) is reported
/// as [`CryptoError::FailedToDecryptContent`].
pub fn open(key: &SymmetricKey, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::FailedToDecryptContent);
    }

    let nonce_bytes: [u8; NONCE_LEN] = blob[..NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::FailedToDecryptContent)?;
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    cipher
        .decrypt(
            &Nonce::from(nonce_bytes),
            Payload {
                msg: &blob[NONCE_LEN..],
                aad,
            },
        )
        .map_err(|_| CryptoError::FailedToDecryptContent)
}

pub fn seal_base64(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<String> {
    Ok(STANDARD.encode(seal(key, plaintext, aad)?))
}

pub fn open_base64(key: &SymmetricKey, encoded: &str, aad: &[u8]) -> Result<Vec<u8>> {
    let blob = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidEncoding(format!("base64: {}", e)))?;
    open(key, &blob, aad)
}
