//! Cryptographic primitives for the sync engine.
//!
//! This module provides:
//! - AES-256-GCM sealing with purpose-bound associated data
//! - HKDF-SHA256 subkey derivation
//! - Ed25519 signatures and key fingerprints

pub mod cipher;
pub mod signing;

pub use cipher::{derive_key, open, open_base64, seal, seal_base64, SymmetricKey};
pub use signing::{fingerprint, sign_detached, verify_detached};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Failed to decrypt content")]
    FailedToDecryptContent,

    #[error("Failed to verify signature: {0}")]
    FailedToVerifySignature(String),

    #[error("Unmatched key rotation: expected {expected}, got {actual}")]
    UnmatchedKeyRotation { expected: i64, actual: i64 },

    #[error("Missing passphrase for share {share_id} rotation {rotation}")]
    MissingPassphrase { share_id: String, rotation: i64 },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Unsupported content format version {0}")]
    UnsupportedContentFormat(u32),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
