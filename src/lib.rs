//! rtconfig - Replicated Table Configuration Service
//!
//! Maintains the replication configuration of a table-storage service: which
//! storage replicas form each chain, in what order, and whether each one may
//! be read or only written. The configuration object is kept in several
//! independent blob locations and read and written by majority.
//!
//! # Architecture
//!
//! - [`quorum`] reads and conditionally writes the configuration blob against
//!   every location at once and decides by strict majority
//! - [`model`] holds the configuration, its views and their replica chains
//! - [`reconfig`] versions views and moves replicas between states
//! - [`manager`] caches the quorum configuration and refreshes it in the
//!   background
//! - [`service`] is the public facade tying these together
//!
//! There is no leader and no replicated log. Concurrent writers are ordered
//! only by each location's concurrency token; a writer that loses must
//! re-read and retry.

pub mod blob;
pub mod codec;
pub mod config;
pub mod error;
pub mod id;
pub mod manager;
pub mod model;
pub mod quorum;
pub mod reconfig;
pub mod service;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use service::ConfigurationService;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::blob::{BlobLocation, BlobStore, HttpBlobStore, MemoryBlobStore};
    pub use crate::config::ServiceConfig;
    pub use crate::error::{Error, Result};
    pub use crate::model::{Configuration, ConfiguredTable, Replica, ReplicaStatus, View};
    pub use crate::quorum::{QuorumReadResult, QuorumWriteResult, UpdateMode};
    pub use crate::service::ConfigurationService;
}
