//! HTTP implementation of [`RemoteApi`].

use crate::keys::EncryptedKeyChainEntry;
use crate::models::{
    CreateItemRequest, ItemBatchRequest, ItemId, ItemRevision, ModifiedItem, Share, ShareId,
    UpdateItemRequest, VaultContentRequest,
};
use crate::remote::{CreateVaultRequest, RemoteApi, RemoteError};
use crate::session::SessionMonitor;
use crate::{Result, VaultSyncError};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// HTTP client for the vault server.
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    session: Arc<SessionMonitor>,
}

impl HttpRemoteApi {
    /// Create a new HTTP client. `timeout` bounds each request at the transport level.
    pub fn new(base_url: &str, session: Arc<SessionMonitor>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultSyncError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> std::result::Result<RequestBuilder, RemoteError> {
        let credentials = self
            .session
            .credentials()
            .ok_or(RemoteError::AuthorizationExpired)?;
        trace!(%method, path, "Remote request");
        Ok(self
            .client
            .request(method, self.url(path))
            .header("x-pm-uid", &credentials.uid)
            .bearer_auth(&credentials.access_token))
    }

    async fn send(&self, builder: RequestBuilder) -> std::result::Result<reqwest::Response, RemoteError> {
        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
        Err(RemoteError::from_status(status.as_u16(), body))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, RemoteError> {
        let resp = self.send(self.request(Method::GET, path)?).await?;
        decode(resp).await
    }

    async fn send_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> std::result::Result<T, RemoteError> {
        let resp = self.send(self.request(method, path)?.json(body)).await?;
        decode(resp).await
    }

    async fn send_empty<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> std::result::Result<(), RemoteError> {
        let mut builder = self.request(method, path)?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(builder).await?;
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_decode() {
        RemoteError::InvalidResponse(e.to_string())
    } else {
        RemoteError::Transient(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> std::result::Result<T, RemoteError> {
    let bytes = resp.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

fn paged(path: String, page: u32, page_size: u32) -> String {
    format!("{}?page={}&page_size={}", path, page, page_size)
}

#[derive(Serialize)]
struct LastUseBody {
    last_use_time: i64,
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn list_shares(&self) -> std::result::Result<Vec<Share>, RemoteError> {
        self.get_json("/api/v1/shares").await
    }

    async fn list_share_keys(
        &self,
        share_id: &ShareId,
        page: u32,
        page_size: u32,
    ) -> std::result::Result<Vec<EncryptedKeyChainEntry>, RemoteError> {
        self.get_json(&paged(format!("/api/v1/shares/{}/keys", share_id), page, page_size))
            .await
    }

    async fn list_items(
        &self,
        share_id: &ShareId,
        page: u32,
        page_size: u32,
    ) -> std::result::Result<Vec<ItemRevision>, RemoteError> {
        self.get_json(&paged(format!("/api/v1/shares/{}/items", share_id), page, page_size))
            .await
    }

    async fn get_item(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
    ) -> std::result::Result<ItemRevision, RemoteError> {
        self.get_json(&format!("/api/v1/shares/{}/items/{}", share_id, item_id))
            .await
    }

    async fn create_item(
        &self,
        share_id: &ShareId,
        request: &CreateItemRequest,
    ) -> std::result::Result<ItemRevision, RemoteError> {
        self.send_json(Method::POST, &format!("/api/v1/shares/{}/items", share_id), request)
            .await
    }

    async fn update_item(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        request: &UpdateItemRequest,
    ) -> std::result::Result<ItemRevision, RemoteError> {
        self.send_json(
            Method::PUT,
            &format!("/api/v1/shares/{}/items/{}", share_id, item_id),
            request,
        )
        .await
    }

    async fn trash_items(
        &self,
        share_id: &ShareId,
        request: &ItemBatchRequest,
    ) -> std::result::Result<Vec<ModifiedItem>, RemoteError> {
        self.send_json(Method::POST, &format!("/api/v1/shares/{}/items/trash", share_id), request)
            .await
    }

    async fn untrash_items(
        &self,
        share_id: &ShareId,
        request: &ItemBatchRequest,
    ) -> std::result::Result<Vec<ModifiedItem>, RemoteError> {
        self.send_json(Method::POST, &format!("/api/v1/shares/{}/items/untrash", share_id), request)
            .await
    }

    async fn delete_items(
        &self,
        share_id: &ShareId,
        request: &ItemBatchRequest,
    ) -> std::result::Result<(), RemoteError> {
        self.send_empty(
            Method::POST,
            &format!("/api/v1/shares/{}/items/delete", share_id),
            Some(request),
        )
        .await
    }

    async fn update_last_use(
        &self,
        share_id: &ShareId,
        item_id: &ItemId,
        last_use_time: i64,
    ) -> std::result::Result<(), RemoteError> {
        self.send_empty(
            Method::PUT,
            &format!("/api/v1/shares/{}/items/{}/last-use", share_id, item_id),
            Some(&LastUseBody { last_use_time }),
        )
        .await
    }

    async fn create_vault(&self, request: &CreateVaultRequest) -> std::result::Result<Share, RemoteError> {
        self.send_json(Method::POST, "/api/v1/vaults", request).await
    }

    async fn update_vault(
        &self,
        share_id: &ShareId,
        request: &VaultContentRequest,
    ) -> std::result::Result<Share, RemoteError> {
        self.send_json(Method::PUT, &format!("/api/v1/vaults/{}", share_id), request)
            .await
    }

    async fn delete_vault(&self, share_id: &ShareId) -> std::result::Result<(), RemoteError> {
        self.send_empty::<()>(Method::DELETE, &format!("/api/v1/vaults/{}", share_id), None)
            .await
    }
}
