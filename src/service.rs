//! Configuration Service
//!
//! Public facade over the replicated configuration: quorum reads, versioned
//! updates, table and view lookups, and replica switch-off. Owns the
//! [`ConfigurationManager`] and its monitor for as long as the service
//! lives. Call [`ConfigurationService::shutdown`] to stop the monitor; drop
//! only aborts it as a last resort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::blob::{BlobLocation, BlobStore, HttpBlobStore};
use crate::config::ServiceConfig;
use crate::error::{Error, OperationStage, Result, StageResult};
use crate::manager::{lock_timeout_from_secs, ConfigurationManager, DEFAULT_MONITOR_INTERVAL};
use crate::model::{Configuration, View};
use crate::quorum::{self, QuorumReadResult, QuorumWriteResult, ReadBlobResult, UpdateMode};
use crate::reconfig;

/// Replicated table configuration service
pub struct ConfigurationService {
    manager: Arc<ConfigurationManager>,
    disposed: AtomicBool,
}

impl ConfigurationService {
    /// Create a service over HTTP blob locations and start its monitor
    pub fn new(locations: Vec<BlobLocation>, use_https: bool, lock_timeout_secs: u64) -> Result<Self> {
        let store = Arc::new(HttpBlobStore::new(use_https));
        Self::with_store(
            locations,
            use_https,
            lock_timeout_secs,
            DEFAULT_MONITOR_INTERVAL,
            store,
        )
    }

    /// Create a service from a loaded configuration file
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(HttpBlobStore::new(config.store.use_https));
        Self::with_store(
            config.store.locations.clone(),
            config.store.use_https,
            config.store.lock_timeout_secs,
            config.monitor_interval(),
            store,
        )
    }

    /// Create a service over any blob store and start its monitor
    pub fn with_store(
        locations: Vec<BlobLocation>,
        use_https: bool,
        lock_timeout_secs: u64,
        monitor_interval: Duration,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        if locations.is_empty() {
            return Err(Error::InvalidArgument("at least one blob location is required".into()));
        }

        let manager = Arc::new(ConfigurationManager::new(
            locations,
            use_https,
            lock_timeout_from_secs(lock_timeout_secs),
            monitor_interval,
            store,
        ));
        manager.start_monitor()?;

        Ok(Self {
            manager,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn manager(&self) -> &ConfigurationManager {
        &self.manager
    }

    /// Read the configuration agreed by a majority of locations
    pub async fn retrieve_configuration(&self) -> (QuorumReadResult, Option<Configuration>) {
        let read = quorum::read_quorum(
            self.manager.store(),
            self.manager.blobs(),
            self.manager.lock_timeout(),
        )
        .await;

        if !read.result.is_success() {
            tracing::error!("Failed to read configuration, result={}", read.result);
        }

        (read.result, read.configuration)
    }

    /// Read every location's copy, for inspection only
    pub async fn retrieve_all_configurations(&self) -> Vec<ReadBlobResult> {
        quorum::read_all(
            self.manager.store(),
            self.manager.blobs(),
            self.manager.lock_timeout(),
        )
        .await
    }

    /// Locations currently holding a configuration blob
    ///
    /// Locations that cannot be reached are logged and left out.
    pub async fn populated_locations(&self) -> Vec<BlobLocation> {
        let listed = self.manager.store().list(self.manager.blobs()).await;

        let mut populated = Vec::with_capacity(listed.len());
        for (location, present) in listed {
            match present {
                Ok(true) => populated.push(location),
                Ok(false) => {}
                Err(e) => tracing::warn!("Cannot list {}: {}", location, e),
            }
        }
        populated
    }

    /// Version and persist a configuration
    ///
    /// Every view without a view id gets the next id after the latest stored
    /// view of the same name, and the write-only replicas at its head are
    /// marked as joined in that view. Fails without writing when too few
    /// locations can be read to know the latest views.
    ///
    /// In [`UpdateMode::Conditional`] the write only lands where the stored
    /// id equals `configuration.id`. On success the cache is invalidated and
    /// `configuration` becomes the written copy, carrying its new id.
    pub async fn update_configuration(
        &self,
        configuration: &mut Configuration,
        mode: UpdateMode,
    ) -> Result<QuorumWriteResult> {
        configuration.validate()?;

        let current_views = self.manager.latest_views().await?;
        reconfig::sanitize_configuration(configuration, Utc::now(), |name| {
            current_views.get(name).cloned().unwrap_or_default()
        });

        let write = quorum::write_quorum(
            self.manager.store(),
            self.manager.blobs(),
            configuration,
            mode,
            self.manager.lock_timeout(),
        )
        .await?;

        if write.result.is_success() {
            self.manager.invalidate().await;
            tracing::info!(
                "Configuration updated: {} -> {} ({}/{} locations)",
                if configuration.id.is_empty() { "<new>" } else { configuration.id.as_str() },
                write.written.id,
                write.accepted(),
                self.manager.blobs().len()
            );
            *configuration = write.written;
        } else {
            tracing::error!("Failed to update configuration, result={}", write.result);
        }

        Ok(write.result)
    }

    /// Whether a table has a record naming a view
    ///
    /// Placeholder records, with no view name, do not count.
    pub async fn is_configured_table(&self, table_name: &str) -> bool {
        match self.manager.find_configured_table(table_name).await {
            None => false,
            Some(table) => !table.is_placeholder(),
        }
    }

    /// A view by name, empty if unknown
    pub async fn get_view(&self, view_name: &str) -> View {
        self.manager.get_view(view_name).await
    }

    /// Bring a storage account back into its chains
    ///
    /// Intentionally does nothing: the target status and head position for a
    /// returning replica are not settled.
    pub fn turn_replica_on(&self, storage_account_name: &str) {
        tracing::debug!("TurnReplicaOn={}: no-op", storage_account_name);
    }

    /// Switch a storage account off in every view
    pub async fn turn_replica_off(&self, storage_account_name: &str) -> Result<()> {
        const OPERATION: &str = "TurnReplicaOff";

        if storage_account_name.is_empty() {
            return Err(Error::InvalidArgument("storage account name cannot be empty".into()));
        }

        let (read_result, configuration) = self.retrieve_configuration().await;
        let mut configuration = match (read_result, configuration) {
            (QuorumReadResult::Success, Some(configuration)) => configuration,
            (result, _) => {
                tracing::error!(
                    "{}={}: failed to read configuration, result={}",
                    OPERATION,
                    storage_account_name,
                    result
                );
                return Err(Error::ReplicaOperation {
                    operation: OPERATION,
                    account: storage_account_name.to_string(),
                    stage: OperationStage::Read,
                    result: StageResult::Read(result),
                });
            }
        };

        let views = configuration
            .views_containing(storage_account_name)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let changed = reconfig::turn_replica_off(&mut configuration, storage_account_name);
        tracing::info!(
            "{}={}: switching off {} replica records in views {:?}",
            OPERATION,
            storage_account_name,
            changed,
            views
        );

        let write_result = match self
            .update_configuration(&mut configuration, UpdateMode::Conditional)
            .await
        {
            Ok(result) => result,
            Err(Error::QuorumRead(result)) => {
                return Err(Error::ReplicaOperation {
                    operation: OPERATION,
                    account: storage_account_name.to_string(),
                    stage: OperationStage::Read,
                    result: StageResult::Read(result),
                });
            }
            Err(e) => return Err(e),
        };
        if !write_result.is_success() {
            tracing::error!(
                "{}={}: failed to update configuration, result={}",
                OPERATION,
                storage_account_name,
                write_result
            );
            return Err(Error::ReplicaOperation {
                operation: OPERATION,
                account: storage_account_name.to_string(),
                stage: OperationStage::Write,
                result: StageResult::Write(write_result),
            });
        }

        Ok(())
    }

    /// Stop the monitor; later calls do nothing
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.stop_monitor().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for ConfigurationService {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.manager.abort_monitor();
        }
    }
}
