//! In-memory blob store
//!
//! Keeps every location in one process. Used for tests and local runs;
//! faults can be injected per location to simulate unreachable or slow
//! stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BlobLocation, BlobStore, StoredBlob, WriteCondition, WriteOutcome};
use crate::error::{Error, Result};

/// Injected misbehaviour of one location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// Every request fails
    Unreachable,
    /// Every request waits this long first
    Delay(Duration),
}

/// Process-local blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    /// location -> stored blob
    blobs: RwLock<HashMap<String, StoredBlob>>,
    /// location -> injected fault
    faults: RwLock<HashMap<String, StoreFault>>,
    /// Source of etags
    next_version: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject or clear a fault for a location
    pub async fn set_fault(&self, location: &BlobLocation, fault: Option<StoreFault>) {
        let mut faults = self.faults.write().await;
        match fault {
            Some(fault) => faults.insert(location.to_string(), fault),
            None => faults.remove(&location.to_string()),
        };
    }

    /// Store bytes directly, bypassing preconditions and faults
    pub async fn put_raw(&self, location: &BlobLocation, bytes: impl Into<Bytes>) -> String {
        let etag = self.new_etag();
        self.blobs.write().await.insert(
            location.to_string(),
            StoredBlob {
                bytes: bytes.into(),
                etag: etag.clone(),
            },
        );
        etag
    }

    /// Read bytes directly, bypassing faults
    pub async fn get_raw(&self, location: &BlobLocation) -> Option<Bytes> {
        self.blobs
            .read()
            .await
            .get(&location.to_string())
            .map(|blob| blob.bytes.clone())
    }

    fn new_etag(&self) -> String {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        format!("\"0x{:016X}\"", version)
    }

    async fn apply_fault(&self, location: &BlobLocation) -> Result<()> {
        let fault = self.faults.read().await.get(&location.to_string()).copied();
        match fault {
            Some(StoreFault::Unreachable) => Err(Error::Storage {
                location: location.to_string(),
                reason: "location unreachable".to_string(),
            }),
            Some(StoreFault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, location: &BlobLocation) -> Result<Option<StoredBlob>> {
        self.apply_fault(location).await?;
        Ok(self.blobs.read().await.get(&location.to_string()).cloned())
    }

    async fn write(
        &self,
        location: &BlobLocation,
        bytes: Bytes,
        condition: WriteCondition,
    ) -> Result<WriteOutcome> {
        self.apply_fault(location).await?;

        let key = location.to_string();
        let mut blobs = self.blobs.write().await;

        let allowed = match (&condition, blobs.get(&key)) {
            (WriteCondition::IfAbsent, existing) => existing.is_none(),
            (WriteCondition::IfMatch(etag), Some(existing)) => existing.etag == *etag,
            (WriteCondition::IfMatch(_), None) => false,
        };

        if !allowed {
            tracing::trace!("memory store: precondition {:?} failed at {}", condition, key);
            return Ok(WriteOutcome::Conflict);
        }

        let etag = self.new_etag();
        blobs.insert(
            key,
            StoredBlob {
                bytes,
                etag: etag.clone(),
            },
        );
        Ok(WriteOutcome::Accepted(etag))
    }
}
