use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::config::{AccountRegistry, Config};
use crate::error::TransferError;
use crate::models::{
    AccountInfo, Entry, EntryTag, FileMetadata, FolderListing, MetadataResult, SearchResult,
    SpaceUsage, TemporaryLink,
};
use crate::transport::{ApiRequest, ApiResponse, Body, Transport};
use crate::utils::api_arg;

/// Authenticated client for one account.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    account: String,
    token: String,
    api_url: String,
    content_url: String,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        account: &str,
        token: &str,
        api_url: &str,
        content_url: &str,
    ) -> Self {
        Self {
            transport,
            account: account.to_string(),
            token: token.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            content_url: content_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn for_account(
        transport: Arc<dyn Transport>,
        config: &Config,
        registry: &AccountRegistry,
        account: &str,
    ) -> Result<Self, TransferError> {
        let acct = registry.get(account)?;
        Ok(Self::new(
            transport,
            account,
            &acct.access_token,
            &config.api_url,
            &config.content_url,
        ))
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.token)
    }

    pub fn content_endpoint(&self, endpoint: &str) -> String {
        format!("{}/{}", self.content_url, endpoint)
    }

    fn execute(&self, endpoint: &str, request: ApiRequest) -> Result<ApiResponse, TransferError> {
        debug!(account = %self.account, endpoint, "request");
        let resp = self
            .transport
            .execute(request.header("Authorization", self.authorization()))?;
        check_status(endpoint, resp)
    }

    /// JSON request to the RPC host.
    pub fn rpc<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: Option<&Value>,
    ) -> Result<T, TransferError> {
        let mut req = ApiRequest::post(format!("{}/{}", self.api_url, endpoint));
        if let Some(params) = params {
            let body = serde_json::to_vec(params).map_err(|e| TransferError::Decode {
                endpoint: endpoint.to_string(),
                source: e,
            })?;
            req = req
                .header("Content-Type", "application/json")
                .body(Body::Bytes(body));
        }
        let resp = self.execute(endpoint, req)?;
        decode(endpoint, resp)
    }

    /// Octet-stream upload to the content host with `arg` in the API header.
    pub fn upload<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        arg: &Value,
        body: Body,
    ) -> Result<T, TransferError> {
        let req = ApiRequest::post(self.content_endpoint(endpoint))
            .header("Content-Type", "application/octet-stream")
            .header("Dropbox-API-Arg", api_arg(arg)?)
            .body(body);
        let resp = self.execute(endpoint, req)?;
        decode(endpoint, resp)
    }

    /// Starts a download of `path`, optionally limited to an inclusive byte range.
    pub fn download(
        &self,
        path: &str,
        range: Option<(u64, u64)>,
    ) -> Result<ApiResponse, TransferError> {
        let endpoint = "files/download";
        let mut req = ApiRequest::post(self.content_endpoint(endpoint))
            .header("Dropbox-API-Arg", api_arg(&json!({ "path": path }))?);
        if let Some((first, last)) = range {
            req = req.header("Range", format!("bytes={}-{}", first, last));
        }
        self.execute(endpoint, req)
    }

    /// Lists a folder, following continuation cursors.
    pub fn list_folder(&self, path: &str) -> Result<Vec<Entry>, TransferError> {
        let mut listing: FolderListing =
            self.rpc("files/list_folder", Some(&json!({ "path": path })))?;
        let mut entries = std::mem::take(&mut listing.entries);
        while listing.has_more {
            listing = self.rpc(
                "files/list_folder/continue",
                Some(&json!({ "cursor": listing.cursor })),
            )?;
            entries.append(&mut listing.entries);
        }
        Ok(entries)
    }

    pub fn get_metadata(&self, path: &str) -> Result<FileMetadata, TransferError> {
        if path.is_empty() {
            return Ok(FileMetadata {
                tag: Some(EntryTag::Folder),
                ..FileMetadata::default()
            });
        }
        self.rpc("files/get_metadata", Some(&json!({ "path": path })))
    }

    /// Fails with a 409 protocol error when the folder already exists.
    pub fn create_folder(&self, path: &str) -> Result<FileMetadata, TransferError> {
        let res: MetadataResult = self.rpc(
            "files/create_folder_v2",
            Some(&json!({ "path": path, "autorename": false })),
        )?;
        Ok(res.metadata)
    }

    pub fn move_entry(&self, from: &str, to: &str) -> Result<FileMetadata, TransferError> {
        let res: MetadataResult = self.rpc(
            "files/move_v2",
            Some(&json!({ "from_path": from, "to_path": to })),
        )?;
        Ok(res.metadata)
    }

    pub fn delete(&self, path: &str) -> Result<FileMetadata, TransferError> {
        let res: MetadataResult = self.rpc("files/delete_v2", Some(&json!({ "path": path })))?;
        Ok(res.metadata)
    }

    pub fn search(&self, path: &str, query: &str) -> Result<Vec<FileMetadata>, TransferError> {
        let res: SearchResult = self.rpc(
            "files/search_v2",
            Some(&json!({ "query": query, "options": { "path": path } })),
        )?;
        Ok(res
            .matches
            .into_iter()
            .map(|m| m.metadata.metadata)
            .collect())
    }

    pub fn temporary_link(&self, path: &str) -> Result<TemporaryLink, TransferError> {
        self.rpc("files/get_temporary_link", Some(&json!({ "path": path })))
    }

    pub fn current_account(&self) -> Result<AccountInfo, TransferError> {
        self.rpc("users/get_current_account", None)
    }

    pub fn space_usage(&self) -> Result<SpaceUsage, TransferError> {
        self.rpc("users/get_space_usage", None)
    }
}

fn check_status(endpoint: &str, resp: ApiResponse) -> Result<ApiResponse, TransferError> {
    if resp.is_success() {
        return Ok(resp);
    }
    let status = resp.status;
    let body = resp.text().unwrap_or_default();
    Err(TransferError::Protocol {
        endpoint: endpoint.to_string(),
        status,
        body,
    })
}

fn decode<T: DeserializeOwned>(endpoint: &str, resp: ApiResponse) -> Result<T, TransferError> {
    let text = resp.text()?;
    serde_json::from_str(&text).map_err(|e| TransferError::Decode {
        endpoint: endpoint.to_string(),
        source: e,
    })
}
