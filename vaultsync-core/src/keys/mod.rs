//! Vault key hierarchy.
//!
//! Each vault owns a chain of key rotations. One rotation bundles a signing
//! key, a vault key and an item key, each stored remotely as a signed blob
//! wrapped under its parent:
//!
//! ```text
//! address key ──signs/wraps──► signing key ──signs/wraps──► vault key ──wraps──► item key
//! ```

pub mod chain;
pub mod manager;

pub use chain::{AddressKey, EncryptedKeyBlob, EncryptedKeyChainEntry, KeyChainEntry};
pub use manager::KeyHierarchyManager;
