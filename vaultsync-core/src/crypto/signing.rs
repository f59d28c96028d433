//! Ed25519 signatures over key material and issuer fingerprints.

use crate::crypto::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of a verifying key.
pub fn fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Sign `message`, returning the base64 signature.
pub fn sign_detached(key: &SigningKey, message: &[u8]) -> String {
    STANDARD.encode(key.sign(message).to_bytes())
}

/// Verify a detached signature issued by `key`.
///
/// The issuer fingerprint is compared before the signature itself so a blob
/// signed by an unexpected key is rejected even if its signature is valid.
pub fn verify_detached(
    key: &VerifyingKey,
    expected_fingerprint: &str,
    message: &[u8],
    signature_b64: &str,
) -> Result<()> {
    let actual = fingerprint(key);
    if actual != expected_fingerprint {
        return Err(CryptoError::FailedToVerifySignature(format!(
            "issuer fingerprint mismatch: expected {}, got {}",
            expected_fingerprint, actual
        )));
    }

    let bytes = STANDARD
        .decode(signature_b64)
        .map_err(|e| CryptoError::FailedToVerifySignature(format!("signature encoding: {}", e)))?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|e| CryptoError::FailedToVerifySignature(format!("malformed signature: {}", e)))?;

    key.verify(message, &signature)
        .map_err(|_| CryptoError::FailedToVerifySignature("signature does not verify".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_verify_roundtrip() {
        let key = SigningKey::generate(&mut OsRng);
        let vk = key.verifying_key();
        let sig = sign_detached(&key, b"payload");
        verify_detached(&vk, &fingerprint(&vk), b"payload", &sig).unwrap();
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let key = SigningKey::generate(&mut OsRng);
        let fp = fingerprint(&key.verifying_key());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn modified_message_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let vk = key.verifying_key();
        let sig = sign_detached(&key, b"payload");
        let err = verify_detached(&vk, &fingerprint(&vk), b"pay1oad", &sig).unwrap_err();
        assert!(matches!(err, CryptoError::FailedToVerifySignature(_)));
    }

    #[test]
    fn fingerprint_mismatch_fails_before_signature_check() {
        let issuer = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let sig = sign_detached(&issuer, b"payload");
        let err = verify_detached(
            &issuer.verifying_key(),
            &fingerprint(&other.verifying_key()),
            b"payload",
            &sig,
        )
        .unwrap_err();
        assert!(err.to_string().contains("fingerprint mismatch"));
    }

    #[test]
    fn garbage_signature_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let vk = key.verifying_key();
        assert!(verify_detached(&vk, &fingerprint(&vk), b"payload", "AAAA").is_err());
    }
}
