//! Sync data models: wire records, cache records and mutation queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Server-assigned identifier of a share. A vault is addressed by its share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(pub String);

/// Identifier of an item within a share. Generated by the client on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// A fresh random id for a locally created item.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

macro_rules! id_conversions {
    ($ty:ident) => {
        impl $ty {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_conversions!(ShareId);
id_conversions!(ItemId);

/// Lifecycle state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Active,
    Trashed,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trashed => "trashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "trashed" => Some(Self::Trashed),
            _ => None,
        }
    }
}

/// A server-side revision of an item.
///
/// `content` is the base64 of `nonce(12) || ciphertext || auth_tag(16)` sealed
/// with the item key of rotation `key_rotation`. The server never sees plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRevision {
    pub item_id: ItemId,
    /// Strictly increasing per item; assigned by the server on every change.
    pub revision: i64,
    pub content_format_version: u32,
    pub key_rotation: i64,
    pub content: String,
    pub state: ItemState,
    pub create_time: i64,
    pub modify_time: i64,
    #[serde(default)]
    pub last_use_time: Option<i64>,
    pub revision_time: i64,
}

/// A share as listed by the server. Vault shares carry encrypted display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub share_id: ShareId,
    pub vault_id: String,
    pub owner: bool,
    /// Highest key rotation of the share's key chain.
    pub key_rotation: i64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_key_rotation: Option<i64>,
    #[serde(default)]
    pub content_format_version: Option<u32>,
    pub create_time: i64,
}

/// Server acknowledgement of a state change (trash, untrash, delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedItem {
    pub item_id: ItemId,
    pub revision: i64,
    pub state: ItemState,
    pub modify_time: i64,
    pub revision_time: i64,
}

/// Last-use timestamp update for an item. Does not bump the revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUseItem {
    pub item_id: ItemId,
    pub last_use_time: i64,
}

/// Reference to a specific revision of an item, used by bulk requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRevisionRef {
    pub item_id: ItemId,
    pub revision: i64,
}

/// Locally cached form of an item.
///
/// `encrypted_revision` is the serialized [`ItemRevision`] (whose content is
/// still server-encrypted) sealed again under the device key. The remaining
/// fields are cleartext metadata needed to query the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricallyEncryptedItem {
    pub share_id: ShareId,
    pub item_id: ItemId,
    pub revision: i64,
    pub key_rotation: i64,
    pub state: ItemState,
    pub modify_time: i64,
    pub last_use_time: Option<i64>,
    /// True while a local mutation of this item awaits push.
    pub pending: bool,
    pub encrypted_revision: String,
}

/// Listing progress of a pass that has not finished yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialListing {
    /// First page not yet applied.
    pub next_page: u32,
    /// Revisions seen on the applied pages.
    pub seen: BTreeMap<ItemId, i64>,
}

/// Per-share sync progress. Survives restarts and `stop()`; cleared by `reset()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub share_id: ShareId,
    /// Revision set of the last completed pass.
    pub known_revisions: BTreeMap<ItemId, i64>,
    pub in_progress: Option<PartialListing>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn new(share_id: ShareId) -> Self {
        Self {
            share_id,
            known_revisions: BTreeMap::new(),
            in_progress: None,
            last_synced_at: None,
        }
    }
}

/// A local change waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationKind {
    Create {
        key_rotation: i64,
        content_format_version: u32,
        content: String,
    },
    Update {
        key_rotation: i64,
        content_format_version: u32,
        content: String,
    },
    Trash,
    Untrash,
    Delete,
    LastUse {
        last_use_time: i64,
    },
}

impl MutationKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Trash => "trash",
            Self::Untrash => "untrash",
            Self::Delete => "delete",
            Self::LastUse { .. } => "last_use",
        }
    }
}

/// Queue entry of the local mutation outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Queue position, assigned by the store; pushes happen in this order.
    pub seq: i64,
    pub share_id: ShareId,
    pub item_id: ItemId,
    /// Remote revision the change was made against (0 for creations).
    pub base_revision: i64,
    pub kind: MutationKind,
    /// Set when a conflict persisted under the manual policy.
    pub conflicted: bool,
    pub queued_at: i64,
}

/// Request body for creating an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateItemRequest {
    pub item_id: ItemId,
    pub key_rotation: i64,
    pub content_format_version: u32,
    pub content: String,
}

/// Request body for updating an item against a base revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItemRequest {
    pub key_rotation: i64,
    pub last_revision: i64,
    pub content_format_version: u32,
    pub content: String,
}

/// Request body for bulk trash, untrash and delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemBatchRequest {
    pub items: Vec<ItemRevisionRef>,
}

/// Request body for creating or updating vault display metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultContentRequest {
    pub content: String,
    pub content_format_version: u32,
    pub key_rotation: i64,
}
