//! Replica membership records
//!
//! A replica is one storage account's entry in a view's chain.

use serde::{Deserialize, Serialize};

/// Capability of a replica within a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// Not part of the chain
    #[default]
    None,
    /// Receives writes but is not yet safe to read
    WriteOnly,
    /// Receives writes and serves reads
    Readable,
    /// Serves reads only
    ReadOnly,
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaStatus::None => write!(f, "NONE"),
            ReplicaStatus::WriteOnly => write!(f, "WRITE_ONLY"),
            ReplicaStatus::Readable => write!(f, "READABLE"),
            ReplicaStatus::ReadOnly => write!(f, "READ_ONLY"),
        }
    }
}

/// One storage endpoint's membership record in a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
    /// Storage account (endpoint identity)
    pub storage_account_name: String,
    /// Current status
    pub status: ReplicaStatus,
    /// View id at which this replica last entered the chain as a write-only head
    #[serde(default)]
    pub view_in_which_added_to_chain: i64,
}

impl Replica {
    /// Create a replica record with the given status
    pub fn new(storage_account_name: impl Into<String>, status: ReplicaStatus) -> Self {
        Self {
            storage_account_name: storage_account_name.into(),
            status,
            view_in_which_added_to_chain: 0,
        }
    }

    pub fn is_write_only(&self) -> bool {
        self.status == ReplicaStatus::WriteOnly
    }

    /// Readable or read-only replicas may serve reads
    pub fn is_readable(&self) -> bool {
        matches!(self.status, ReplicaStatus::Readable | ReplicaStatus::ReadOnly)
    }

    /// Write-only or readable replicas accept writes
    pub fn is_writable(&self) -> bool {
        matches!(self.status, ReplicaStatus::WriteOnly | ReplicaStatus::Readable)
    }

    /// Whether the replica currently participates in the chain
    pub fn is_active(&self) -> bool {
        self.status != ReplicaStatus::None
    }
}
