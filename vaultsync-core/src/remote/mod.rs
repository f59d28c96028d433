//! Remote API seam and error taxonomy.

pub mod client;
pub mod http;

pub use client::{PushOperation, PushOutcome, RemoteSyncClient, RetryPolicy};
pub use http::HttpRemoteApi;

use crate::keys::EncryptedKeyChainEntry;
use crate::models::{
    CreateItemRequest, ItemBatchRequest, ItemId, ItemRevision, ModifiedItem, Share, ShareId,
    UpdateItemRequest, VaultContentRequest,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the remote API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, timeout, throttling or server-side error. Retryable.
    #[error("Transient remote error: {0}")]
    Transient(String),

    #[error("Authorization expired")]
    AuthorizationExpired,

    /// The base revision of a write no longer matches the server.
    #[error("Revision conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status code.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::AuthorizationExpired,
            404 => Self::NotFound(message),
            409 | 422 => Self::Conflict(message),
            408 | 429 | 500..=599 => Self::Transient(format!("HTTP {}: {}", status, message)),
            _ => Self::Rejected { status, message },
        }
    }
}

/// Request body for creating a vault with its first key rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVaultRequest {
    pub vault_id: String,
    pub content: String,
    pub content_format_version: u32,
    pub keys: EncryptedKeyChainEntry,
}

/// Server endpoints used by the engine. All payloads are already encrypted.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list_shares(&self) -> Result<Vec<Share>, RemoteError>;

    async fn list_share_keys(
        &self,
        share_id: &ShareId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<EncryptedKeyChainEntry>, RemoteError>;

    async fn list_items(
        &self,
        share_id: &ShareId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ItemRevision>, RemoteError>;

    async fn get_item(&self, share_id: &ShareId, item_id: &ItemId) -> Result<ItemRevision, RemoteError>;

    async fn create_item(
        &self,
        share_id: &ShareId,
        request: &CreateItemRequest,
    ) -> Result<ItemRevision, RemoteError>;

    async fn update_item(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        request: &UpdateItemRequest,
    ) -> Result<ItemRevision, RemoteError>;

    async fn trash_items(
        &self,
        share_id: &ShareId,
        request: &ItemBatchRequest,
    ) -> Result<Vec<ModifiedItem>, RemoteError>;

    async fn untrash_items(
        &self,
        share_id: &ShareId,
        request: &ItemBatchRequest,
    ) -> Result<Vec<ModifiedItem>, RemoteError>;

    async fn delete_items(&self, share_id: &ShareId, request: &ItemBatchRequest) -> Result<(), RemoteError>;

    async fn update_last_use(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        last_use_time: i64,
    ) -> Result<(), RemoteError>;

    async fn create_vault(&self, request: &CreateVaultRequest) -> Result<Share, RemoteError>;

    async fn update_vault(
        &self,
        share_id: &ShareId,
        request: &VaultContentRequest,
    ) -> Result<Share, RemoteError>;

    async fn delete_vault(&self, share_id: &ShareId) -> Result<(), RemoteError>;
}
