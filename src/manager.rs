//! Configuration Manager
//!
//! Owns the blob locations and a read-through, write-invalidate cache of the
//! quorum configuration. The cached value is an immutable snapshot; refresh
//! and invalidation replace it wholesale and bump the cache epoch. A refresh
//! that started before an invalidation is discarded instead of installed, so
//! a write is never hidden by a read that raced it.
//!
//! A background monitor refreshes the snapshot periodically. Refresh
//! failures keep the previous snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::blob::{BlobLocation, BlobStore};
use crate::error::{Error, Result};
use crate::model::{Configuration, ConfiguredTable, View};
use crate::quorum::{self, QuorumReadResult, ReadStatus};

/// Per-location timeout used when none is configured
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Monitor refresh period used when none is configured
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Resolve a timeout given in seconds, 0 meaning the default
pub fn lock_timeout_from_secs(secs: u64) -> Duration {
    if secs == 0 {
        DEFAULT_LOCK_TIMEOUT
    } else {
        Duration::from_secs(secs)
    }
}

/// Immutable cached snapshot
#[derive(Debug, Clone)]
pub struct CachedConfiguration {
    pub configuration: Arc<Configuration>,
    /// Cache epoch at which this snapshot was installed
    pub epoch: u64,
}

struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owner of the locations and the cached configuration
pub struct ConfigurationManager {
    locations: Vec<BlobLocation>,
    use_https: bool,
    store: Arc<dyn BlobStore>,
    lock_timeout: Duration,
    monitor_interval: Duration,
    cache: RwLock<Option<CachedConfiguration>>,
    /// Bumped on every install or invalidation, under the cache write lock
    epoch: AtomicU64,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl ConfigurationManager {
    pub fn new(
        locations: Vec<BlobLocation>,
        use_https: bool,
        lock_timeout: Duration,
        monitor_interval: Duration,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            locations,
            use_https,
            store,
            lock_timeout,
            monitor_interval,
            cache: RwLock::new(None),
            epoch: AtomicU64::new(0),
            monitor: Mutex::new(None),
        }
    }

    /// The configured blob locations
    pub fn blobs(&self) -> &[BlobLocation] {
        &self.locations
    }

    pub fn use_https(&self) -> bool {
        self.use_https
    }

    pub fn store(&self) -> &dyn BlobStore {
        self.store.as_ref()
    }

    /// Per-location operation timeout
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Current cache epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// The cached snapshot, if one is installed
    pub async fn cached(&self) -> Option<CachedConfiguration> {
        self.cache.read().await.clone()
    }

    /// Re-read the quorum configuration and install it
    pub async fn refresh(&self) -> QuorumReadResult {
        self.fetch().await.0
    }

    /// Quorum read that installs its result unless a cache change raced it
    ///
    /// The configuration read is returned either way.
    async fn fetch(&self) -> (QuorumReadResult, Option<Arc<Configuration>>) {
        let started_at = self.epoch();
        let read = quorum::read_quorum(self.store(), &self.locations, self.lock_timeout).await;

        let configuration = match (read.result, read.configuration) {
            (QuorumReadResult::Success, Some(configuration)) => Arc::new(configuration),
            (result, _) => {
                tracing::warn!("Configuration refresh failed, result={}", result);
                return (result, None);
            }
        };

        let mut cache = self.cache.write().await;
        if self.epoch() != started_at {
            tracing::debug!("Discarding refresh of {} raced by a cache change", configuration.id);
            return (QuorumReadResult::Success, Some(configuration));
        }

        let previous_id = cache.as_ref().map(|c| c.configuration.id.clone());
        if previous_id.as_deref() != Some(configuration.id.as_str()) {
            tracing::info!(
                "Configuration snapshot {} -> {}",
                previous_id.as_deref().unwrap_or("<none>"),
                configuration.id
            );
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *cache = Some(CachedConfiguration {
            configuration: Arc::clone(&configuration),
            epoch,
        });

        (QuorumReadResult::Success, Some(configuration))
    }

    /// Drop the snapshot so the next read goes to storage
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *cache = None;
        tracing::debug!("Configuration cache invalidated");
    }

    /// The configuration as storage holds it now, bypassing the cache
    ///
    /// `Ok(None)` means no location holds a configuration yet. Any other
    /// failed read is an error.
    pub async fn load(&self) -> Result<Option<Arc<Configuration>>> {
        match self.fetch().await {
            (QuorumReadResult::Success, Some(configuration)) => Ok(Some(configuration)),
            (QuorumReadResult::BlobNotFound, _) => Ok(None),
            (result, _) => Err(Error::QuorumRead(result)),
        }
    }

    /// Highest-numbered view of every name held by any location
    ///
    /// A configuration accepted by a majority is always seen as long as a
    /// majority of locations return a readable answer, missing blobs
    /// included. Fails when fewer do.
    pub async fn latest_views(&self) -> Result<BTreeMap<String, View>> {
        let results = quorum::read_all(self.store(), &self.locations, self.lock_timeout).await;

        let informed = results
            .iter()
            .filter(|r| matches!(r.status, ReadStatus::Success | ReadStatus::NotFound))
            .count();
        if informed < quorum::majority(results.len()) {
            tracing::warn!(
                "Only {}/{} locations readable, current views unknown",
                informed,
                results.len()
            );
            return Err(Error::QuorumRead(QuorumReadResult::Unreachable));
        }

        let mut views: BTreeMap<String, View> = BTreeMap::new();
        for configuration in results.iter().filter_map(|r| r.configuration.as_ref()) {
            for (name, view) in &configuration.view_map {
                match views.get(name) {
                    Some(known) if known.view_id >= view.view_id => {}
                    _ => {
                        views.insert(name.clone(), view.clone());
                    }
                }
            }
        }

        Ok(views)
    }

    /// The cached snapshot, reading through on a miss
    pub async fn current(&self) -> Result<Option<Arc<Configuration>>> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(Some(Arc::clone(&cached.configuration)));
        }
        self.load().await
    }

    /// The cached snapshot, `None` if it cannot be read
    pub async fn snapshot(&self) -> Option<Arc<Configuration>> {
        self.current().await.ok().flatten()
    }

    /// Explicit record for a table, else the default record
    pub async fn find_configured_table(&self, table_name: &str) -> Option<ConfiguredTable> {
        self.snapshot()
            .await?
            .find_configured_table(table_name)
            .cloned()
    }

    /// A view by name, empty if unknown or unreadable
    pub async fn get_view(&self, view_name: &str) -> View {
        self.snapshot()
            .await
            .and_then(|configuration| configuration.view(view_name).cloned())
            .unwrap_or_default()
    }

    /// Start the background refresh loop
    ///
    /// Must be called from within a tokio runtime. Starting twice is a no-op.
    pub fn start_monitor(self: &Arc<Self>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("monitor needs a tokio runtime: {}", e)))?;

        let mut monitor = lock_monitor(&self.monitor);
        if monitor.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(run_monitor(
            Arc::downgrade(self),
            self.monitor_interval,
            shutdown_rx,
        ));

        *monitor = Some(MonitorHandle {
            shutdown: shutdown_tx,
            task,
        });
        tracing::info!(
            "Configuration monitor started: {} locations, every {:?}",
            self.locations.len(),
            self.monitor_interval
        );
        Ok(())
    }

    /// Stop the background refresh loop and wait for it to exit
    pub async fn stop_monitor(&self) {
        let handle = lock_monitor(&self.monitor).take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            if let Err(e) = handle.task.await {
                if !e.is_cancelled() {
                    tracing::error!("Configuration monitor ended abnormally: {}", e);
                }
            }
            tracing::info!("Configuration monitor stopped");
        }
    }

    /// Abort the refresh loop without waiting
    pub fn abort_monitor(&self) {
        if let Some(handle) = lock_monitor(&self.monitor).take() {
            handle.task.abort();
            tracing::debug!("Configuration monitor aborted");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock_monitor(&self.monitor).is_some()
    }
}

fn lock_monitor(monitor: &Mutex<Option<MonitorHandle>>) -> std::sync::MutexGuard<'_, Option<MonitorHandle>> {
    match monitor.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_monitor(
    manager: Weak<ConfigurationManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let result = manager.refresh().await;
                tracing::trace!("Monitor refresh: {}", result);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{MemoryBlobStore, StoreFault};
    use crate::codec;
    use crate::id;
    use crate::model::{Replica, ReplicaStatus};

    fn locations() -> Vec<BlobLocation> {
        (0..3).map(|i| BlobLocation::new(format!("loc{}", i))).collect()
    }

    fn config_with_view(view_id: i64) -> Configuration {
        let mut view = View::with_chain(vec![Replica::new("acct", ReplicaStatus::Readable)]);
        view.view_id = view_id;
        let mut config = Configuration::new();
        config.set_view("view1", view);
        config.set_configured_table(ConfiguredTable::new("orders", "view1"));
        id::with_new_id(&config).unwrap()
    }

    async fn seed_all(store: &MemoryBlobStore, config: &Configuration) {
        for loc in locations() {
            store.put_raw(&loc, codec::encode(config).unwrap()).await;
        }
    }

    fn manager(store: Arc<MemoryBlobStore>, interval: Duration) -> Arc<ConfigurationManager> {
        Arc::new(ConfigurationManager::new(
            locations(),
            false,
            Duration::from_secs(1),
            interval,
            store,
        ))
    }

    #[test]
    fn test_lock_timeout_default() {
        assert_eq!(lock_timeout_from_secs(0), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(lock_timeout_from_secs(3), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_read_through_and_invalidate() {
        let store = Arc::new(MemoryBlobStore::new());
        seed_all(&store, &config_with_view(1)).await;
        let manager = manager(store.clone(), DEFAULT_MONITOR_INTERVAL);

        assert!(manager.cached().await.is_none());
        assert_eq!(manager.get_view("view1").await.view_id, 1);
        assert!(manager.cached().await.is_some());

        seed_all(&store, &config_with_view(2)).await;
        assert_eq!(manager.get_view("view1").await.view_id, 1, "served from cache");

        manager.invalidate().await;
        assert_eq!(manager.get_view("view1").await.view_id, 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let store = Arc::new(MemoryBlobStore::new());
        seed_all(&store, &config_with_view(5)).await;
        let manager = manager(store.clone(), DEFAULT_MONITOR_INTERVAL);
        assert_eq!(manager.refresh().await, QuorumReadResult::Success);

        for loc in locations() {
            store.set_fault(&loc, Some(StoreFault::Unreachable)).await;
        }
        assert_eq!(manager.refresh().await, QuorumReadResult::Unreachable);
        assert_eq!(manager.get_view("view1").await.view_id, 5);
    }

    #[tokio::test]
    async fn test_unknown_names() {
        let store = Arc::new(MemoryBlobStore::new());
        let manager = manager(store.clone(), DEFAULT_MONITOR_INTERVAL);

        assert!(manager.get_view("view1").await.is_empty());
        assert!(manager.find_configured_table("orders").await.is_none());

        seed_all(&store, &config_with_view(1)).await;
        assert!(manager.get_view("missing").await.is_empty());
        assert_eq!(
            manager.find_configured_table("orders").await.unwrap().view_name,
            "view1"
        );
    }

    #[tokio::test]
    async fn test_monitor_refreshes_and_stops() {
        let store = Arc::new(MemoryBlobStore::new());
        seed_all(&store, &config_with_view(1)).await;
        let manager = manager(store.clone(), Duration::from_millis(20));

        manager.start_monitor().unwrap();
        manager.start_monitor().unwrap();
        assert!(manager.is_monitoring());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.cached().await.unwrap().configuration.view("view1").unwrap().view_id, 1);

        seed_all(&store, &config_with_view(2)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.cached().await.unwrap().configuration.view("view1").unwrap().view_id, 2);

        manager.stop_monitor().await;
        assert!(!manager.is_monitoring());

        let epoch = manager.epoch();
        seed_all(&store, &config_with_view(3)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.epoch(), epoch);
    }

    #[tokio::test]
    async fn test_invalidate_discards_racing_refresh() {
        let store = Arc::new(MemoryBlobStore::new());
        seed_all(&store, &config_with_view(1)).await;
        for loc in locations() {
            store.set_fault(&loc, Some(StoreFault::Delay(Duration::from_millis(100)))).await;
        }
        let manager = manager(store.clone(), DEFAULT_MONITOR_INTERVAL);

        let racing = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.invalidate().await;

        assert_eq!(racing.await.unwrap(), QuorumReadResult::Success);
        assert!(manager.cached().await.is_none());
    }

    #[tokio::test]
    async fn test_load_distinguishes_missing_from_unreadable() {
        let store = Arc::new(MemoryBlobStore::new());
        let manager = manager(store.clone(), DEFAULT_MONITOR_INTERVAL);
        assert!(manager.load().await.unwrap().is_none());

        seed_all(&store, &config_with_view(3)).await;
        let locs = locations();
        store.set_fault(&locs[0], Some(StoreFault::Unreachable)).await;
        store.set_fault(&locs[1], Some(StoreFault::Unreachable)).await;

        let err = manager.current().await.unwrap_err();
        assert!(matches!(err, Error::QuorumRead(QuorumReadResult::Unreachable)));
        assert!(manager.get_view("view1").await.is_empty());

        store.set_fault(&locs[1], None).await;
        let loaded = manager.current().await.unwrap().unwrap();
        assert_eq!(loaded.view("view1").unwrap().view_id, 3);
    }

    #[tokio::test]
    async fn test_latest_views_take_highest_id() {
        let store = Arc::new(MemoryBlobStore::new());
        let manager = manager(store.clone(), DEFAULT_MONITOR_INTERVAL);
        assert!(manager.latest_views().await.unwrap().is_empty());

        let locs = locations();
        store.put_raw(&locs[0], codec::encode(&config_with_view(7)).unwrap()).await;
        store.put_raw(&locs[1], codec::encode(&config_with_view(6)).unwrap()).await;

        let views = manager.latest_views().await.unwrap();
        assert_eq!(views["view1"].view_id, 7);

        store.set_fault(&locs[0], Some(StoreFault::Unreachable)).await;
        store.put_raw(&locs[2], b"{broken".to_vec()).await;
        assert!(matches!(
            manager.latest_views().await,
            Err(Error::QuorumRead(QuorumReadResult::Unreachable))
        ));
    }

    #[tokio::test]
    async fn test_load_returns_read_raced_by_invalidate() {
        let store = Arc::new(MemoryBlobStore::new());
        seed_all(&store, &config_with_view(4)).await;
        for loc in locations() {
            store.set_fault(&loc, Some(StoreFault::Delay(Duration::from_millis(100)))).await;
        }
        let manager = manager(store.clone(), DEFAULT_MONITOR_INTERVAL);

        let loading = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.load().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.invalidate().await;

        let loaded = loading.await.unwrap().unwrap().unwrap();
        assert_eq!(loaded.view("view1").unwrap().view_id, 4);
        assert!(manager.cached().await.is_none());
    }
}
