//! Blob Storage
//!
//! The storage capability the quorum layer fans out over: read a named blob
//! together with its concurrency token, and write it back only if the token
//! is unchanged.

mod http;
mod memory;

pub use http::HttpBlobStore;
pub use memory::{MemoryBlobStore, StoreFault};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One place the configuration blob is kept
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocation {
    /// Storage endpoint, with or without a scheme
    pub endpoint: String,
    /// Container holding the blob
    #[serde(default = "default_container")]
    pub container: String,
    /// Blob name within the container
    #[serde(default = "default_blob_name")]
    pub blob_name: String,
    /// Bearer credential for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn default_container() -> String {
    "rtable-config".to_string()
}

fn default_blob_name() -> String {
    "configuration.json".to_string()
}

impl BlobLocation {
    /// Create a location using the default container and blob name
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            container: default_container(),
            blob_name: default_blob_name(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Full blob URL; endpoints without a scheme get one from `use_https`
    pub fn url(&self, use_https: bool) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        let base = if endpoint.contains("://") {
            endpoint.to_string()
        } else if use_https {
            format!("https://{}", endpoint)
        } else {
            format!("http://{}", endpoint)
        };
        format!("{}/{}/{}", base, self.container, self.blob_name)
    }
}

impl std::fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.endpoint, self.container, self.blob_name)
    }
}

/// A blob as read from a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Bytes,
    /// Concurrency token of this version
    pub etag: String,
}

/// Precondition attached to a blob write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Only if the stored version still carries this token
    IfMatch(String),
    /// Only if no blob exists yet
    IfAbsent,
}

/// Result of a conditional write that reached the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written; carries the new token
    Accepted(String),
    /// The precondition did not hold
    Conflict,
}

/// Storage backend capability
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob, `None` if it does not exist
    async fn read(&self, location: &BlobLocation) -> Result<Option<StoredBlob>>;

    /// Write a blob if the condition holds
    async fn write(
        &self,
        location: &BlobLocation,
        bytes: Bytes,
        condition: WriteCondition,
    ) -> Result<WriteOutcome>;

    /// Whether each location currently holds a blob
    ///
    /// Locations are checked concurrently and report independently.
    async fn list(&self, locations: &[BlobLocation]) -> Vec<(BlobLocation, Result<bool>)> {
        let checks = locations.iter().map(|location| async move {
            let present = self.read(location).await.map(|blob| blob.is_some());
            (location.clone(), present)
        });
        join_all(checks).await
    }
}
