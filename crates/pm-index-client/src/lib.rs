//! HTTP client for the remote package index protocol.
//!
//! The wire protocol itself (request shapes, auth, pagination) is out of
//! scope here; this crate only needs to produce the response shape
//! `pm-registry` consumes when it refreshes its local snapshot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexClientError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One resolved entry as the remote index reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    pub version: String,
    pub hash: String,
    pub group_number: i64,
    pub prefix: String,
    pub flags: u32,
    pub dependencies: Vec<String>,
    pub updated_at_unix: i64,
}

/// Response to a `find_dependencies` call: one entry per requested path that
/// the remote could resolve.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FindDependenciesResponse {
    pub entries: HashMap<String, RemoteEntry>,
    pub schema_version: u32,
}

pub struct IndexClient {
    base_url: String,
    client: reqwest::Client,
}

impl IndexClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Resolve a batch of package-path requests against the remote index.
    pub async fn find_dependencies(&self, requests: &[String]) -> Result<FindDependenciesResponse, IndexClientError> {
        let url = format!("{}/find_dependencies", self.base_url);
        let resp = self.client.post(&url).json(&requests).send().await?;
        let resp = resp.error_for_status().map_err(IndexClientError::Network)?;
        resp.json().await.map_err(IndexClientError::Network)
    }

    /// Report that a set of resolved ids were actually downloaded, for
    /// server-side popularity accounting. Fire-and-forget from the core's
    /// perspective.
    pub async fn add_downloads(&self, ids: &[String]) -> Result<(), IndexClientError> {
        let url = format!("{}/add_downloads", self.base_url);
        self.client
            .post(&url)
            .json(&ids)
            .send()
            .await?
            .error_for_status()
            .map_err(IndexClientError::Network)?;
        Ok(())
    }

    /// Report an arbitrary client-call event (telemetry hook named in the
    /// protocol; payload shape is the server's concern).
    pub async fn add_client_call(&self, payload: serde_json::Value) -> Result<(), IndexClientError> {
        let url = format!("{}/add_client_call", self.base_url);
        self.client
            .post(&url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()
            .map_err(IndexClientError::Network)?;
        Ok(())
    }

    /// The remote's current schema version, used by `pm-registry` to decide
    /// whether a cached snapshot needs a clean reload.
    pub async fn schema_version(&self) -> Result<u32, IndexClientError> {
        let url = format!("{}/schema_version", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let resp = resp.error_for_status().map_err(IndexClientError::Network)?;
        let body: serde_json::Value = resp.json().await?;
        body.get("schema_version")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .ok_or_else(|| IndexClientError::InvalidResponse("missing schema_version".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_dependencies_response_defaults_empty() {
        let resp = FindDependenciesResponse::default();
        assert!(resp.entries.is_empty());
        assert_eq!(resp.schema_version, 0);
    }
}
