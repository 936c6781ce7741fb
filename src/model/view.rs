//! Views
//!
//! A view is a named, versioned, ordered chain of replicas. Index 0 of the
//! chain is the head (highest priority); writes flow head to tail and reads
//! are served from the first readable replica onward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::replica::Replica;

/// View id of a placeholder view that has never been written
pub const EMPTY_VIEW_ID: i64 = 0;

/// One named replication topology
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    /// Version of this view, 0 while unpopulated
    #[serde(default)]
    pub view_id: i64,
    /// Last modification time (informational)
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    /// Ordered replica chain, head first
    #[serde(default)]
    pub replica_chain: Vec<Replica>,
}

impl View {
    /// An empty placeholder view
    pub fn empty() -> Self {
        Self::default()
    }

    /// A view with the given chain and no assigned id
    pub fn with_chain(replica_chain: Vec<Replica>) -> Self {
        Self {
            view_id: EMPTY_VIEW_ID,
            timestamp: DateTime::<Utc>::default(),
            replica_chain,
        }
    }

    /// Placeholder view, never written with an id
    ///
    /// A written view whose chain has been drained still carries its id.
    pub fn is_empty(&self) -> bool {
        self.view_id == EMPTY_VIEW_ID
    }

    /// Replicas that currently participate in the chain, head first
    pub fn current_replica_chain(&self) -> impl Iterator<Item = &Replica> {
        self.replica_chain.iter().filter(|r| r.is_active())
    }

    /// Mutable access to participating replicas, head first
    pub fn current_replica_chain_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.replica_chain.iter_mut().filter(|r| r.is_active())
    }

    /// Position of the first readable replica within the current chain
    pub fn read_head_index(&self) -> Option<usize> {
        self.current_replica_chain().position(|r| r.is_readable())
    }

    /// First replica of the current chain; all writes start here
    pub fn write_head(&self) -> Option<&Replica> {
        self.current_replica_chain().next()
    }

    /// Last replica of the current chain
    pub fn tail(&self) -> Option<&Replica> {
        self.current_replica_chain().last()
    }

    /// A view is stable once every participating replica is readable
    pub fn is_stable(&self) -> bool {
        let mut chain = self.current_replica_chain().peekable();
        chain.peek().is_some() && chain.all(|r| r.is_readable())
    }

    /// Look up a replica by storage account name
    pub fn replica(&self, storage_account_name: &str) -> Option<&Replica> {
        self.replica_chain
            .iter()
            .find(|r| r.storage_account_name == storage_account_name)
    }

    pub fn contains_account(&self, storage_account_name: &str) -> bool {
        self.replica(storage_account_name).is_some()
    }
}
