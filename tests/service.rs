//! End-to-end behaviour of the configuration service over in-memory stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rtconfig::blob::{StoreFault, StoredBlob, WriteCondition, WriteOutcome};
use rtconfig::prelude::*;

/// Memory store whose next few reads fail
struct FlakyReads {
    inner: MemoryBlobStore,
    failing: AtomicUsize,
}

impl FlakyReads {
    fn new() -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            failing: AtomicUsize::new(0),
        }
    }

    fn fail_next(&self, reads: usize) {
        self.failing.store(reads, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for FlakyReads {
    async fn read(&self, location: &BlobLocation) -> rtconfig::Result<Option<StoredBlob>> {
        let failed = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Storage {
                location: location.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        self.inner.read(location).await
    }

    async fn write(
        &self,
        location: &BlobLocation,
        bytes: Bytes,
        condition: WriteCondition,
    ) -> rtconfig::Result<WriteOutcome> {
        self.inner.write(location, bytes, condition).await
    }
}

fn locations() -> Vec<BlobLocation> {
    (1..=3)
        .map(|i| BlobLocation::new(format!("account{}.blob.test", i)))
        .collect()
}

fn service(store: &Arc<MemoryBlobStore>) -> ConfigurationService {
    ConfigurationService::with_store(
        locations(),
        false,
        1,
        Duration::from_secs(3600),
        store.clone(),
    )
    .unwrap()
}

fn chain(replicas: &[(&str, ReplicaStatus)]) -> View {
    View::with_chain(
        replicas
            .iter()
            .map(|(name, status)| Replica::new(*name, *status))
            .collect(),
    )
}

async fn bootstrap(service: &ConfigurationService) -> Configuration {
    let mut config = Configuration::new();
    config.set_view(
        "view1",
        chain(&[("acct1", ReplicaStatus::Readable), ("acct2", ReplicaStatus::Readable)]),
    );
    config.set_view(
        "view2",
        chain(&[("acct3", ReplicaStatus::Readable), ("acct1", ReplicaStatus::Readable)]),
    );
    config.set_configured_table(ConfiguredTable::new("orders", "view1"));

    let result = service
        .update_configuration(&mut config, UpdateMode::Conditional)
        .await
        .unwrap();
    assert_eq!(result, QuorumWriteResult::Success);
    config
}

#[tokio::test]
async fn test_view_ids_are_monotonic() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);

    let mut config = bootstrap(&service).await;
    assert_eq!(config.view("view1").unwrap().view_id, 1);

    // Re-writing the read configuration keeps its view id.
    service
        .update_configuration(&mut config, UpdateMode::Conditional)
        .await
        .unwrap();
    assert_eq!(service.get_view("view1").await.view_id, 1);

    // Clearing the view id asks for the next one.
    for expected in 2..=4 {
        config.view_map.get_mut("view1").unwrap().view_id = 0;
        let result = service
            .update_configuration(&mut config, UpdateMode::Conditional)
            .await
            .unwrap();
        assert_eq!(result, QuorumWriteResult::Success);
        assert_eq!(service.get_view("view1").await.view_id, expected);
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_write_only_heads_record_join_view() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    let mut config = bootstrap(&service).await;

    let mut view = chain(&[
        ("new1", ReplicaStatus::WriteOnly),
        ("new2", ReplicaStatus::WriteOnly),
        ("acct1", ReplicaStatus::Readable),
        ("late", ReplicaStatus::WriteOnly),
    ]);
    view.replica_chain[3].view_in_which_added_to_chain = 1;
    config.set_view("view1", view);

    service
        .update_configuration(&mut config, UpdateMode::Conditional)
        .await
        .unwrap();

    let stored = service.get_view("view1").await;
    assert_eq!(stored.view_id, 2);
    let joined: Vec<i64> = stored
        .replica_chain
        .iter()
        .map(|r| r.view_in_which_added_to_chain)
        .collect();
    assert_eq!(joined, vec![2, 2, 0, 1]);
    assert_eq!(stored.read_head_index(), Some(2));

    service.shutdown().await;
}

#[tokio::test]
async fn test_update_invalidates_cache() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    let mut config = bootstrap(&service).await;

    assert_eq!(service.get_view("view1").await.replica_chain.len(), 2);
    let epoch = service.manager().epoch();

    config.set_view("view1", chain(&[("acct9", ReplicaStatus::Readable)]));
    service
        .update_configuration(&mut config, UpdateMode::Conditional)
        .await
        .unwrap();

    assert!(service.manager().epoch() > epoch);

    let view = service.get_view("view1").await;
    assert_eq!(view.replica_chain.len(), 1);
    assert_eq!(view.replica_chain[0].storage_account_name, "acct9");

    service.shutdown().await;
}

#[tokio::test]
async fn test_conditional_and_unconditional_update() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    let config = bootstrap(&service).await;

    let mut stale = config.clone();
    let mut winner = config.clone();
    winner.set_configured_table(ConfiguredTable::new("customers", "view2"));
    assert_eq!(
        service
            .update_configuration(&mut winner, UpdateMode::Conditional)
            .await
            .unwrap(),
        QuorumWriteResult::Success
    );

    stale.set_configured_table(ConfiguredTable::new("invoices", "view2"));
    let mut conditional = stale.clone();
    assert_eq!(
        service
            .update_configuration(&mut conditional, UpdateMode::Conditional)
            .await
            .unwrap(),
        QuorumWriteResult::NoQuorum
    );
    assert!(service.is_configured_table("customers").await);
    assert!(!service.is_configured_table("invoices").await);

    let mut unconditional = stale.clone();
    assert_eq!(
        service
            .update_configuration(&mut unconditional, UpdateMode::Unconditional)
            .await
            .unwrap(),
        QuorumWriteResult::Success
    );
    assert!(service.is_configured_table("invoices").await);
    assert!(!service.is_configured_table("customers").await);

    service.shutdown().await;
}

#[tokio::test]
async fn test_is_configured_table() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    let mut config = bootstrap(&service).await;

    config.set_configured_table(ConfiguredTable::new("pending", ""));
    service
        .update_configuration(&mut config, UpdateMode::Conditional)
        .await
        .unwrap();

    assert!(service.is_configured_table("orders").await);
    assert!(!service.is_configured_table("pending").await);
    assert!(!service.is_configured_table("unknown").await);

    let mut fallback = ConfiguredTable::new("*", "view2");
    fallback.use_as_default = true;
    config.set_configured_table(fallback);
    service
        .update_configuration(&mut config, UpdateMode::Conditional)
        .await
        .unwrap();

    assert!(service.is_configured_table("unknown").await);
    assert!(!service.is_configured_table("pending").await);

    service.shutdown().await;
}

#[tokio::test]
async fn test_turn_replica_off_in_every_view() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    bootstrap(&service).await;

    service.turn_replica_off("acct1").await.unwrap();

    let (result, config) = service.retrieve_configuration().await;
    assert_eq!(result, QuorumReadResult::Success);
    let config = config.unwrap();

    let view1 = config.view("view1").unwrap();
    let view2 = config.view("view2").unwrap();
    assert_eq!(view1.replica("acct1").unwrap().status, ReplicaStatus::None);
    assert_eq!(view2.replica("acct1").unwrap().status, ReplicaStatus::None);
    assert_eq!(view1.replica("acct2").unwrap().status, ReplicaStatus::Readable);
    assert_eq!(view2.replica("acct3").unwrap().status, ReplicaStatus::Readable);
    assert_eq!(view1.view_id, 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_turn_replica_off_failed_read_changes_nothing() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    bootstrap(&service).await;

    let locs = locations();
    let before = store.get_raw(&locs[0]).await.unwrap();
    store.set_fault(&locs[1], Some(StoreFault::Unreachable)).await;
    store.set_fault(&locs[2], Some(StoreFault::Unreachable)).await;

    let err = service.turn_replica_off("acct1").await.unwrap_err();
    match err {
        Error::ReplicaOperation { account, stage, .. } => {
            assert_eq!(account, "acct1");
            assert_eq!(stage, rtconfig::error::OperationStage::Read);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(store.get_raw(&locs[0]).await.unwrap(), before);
    service.shutdown().await;
}

#[tokio::test]
async fn test_turn_replica_off_failed_write_reports_stage() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    bootstrap(&service).await;

    // Each request to these two stores fits the one second budget, but a
    // write needs a read and a write, which does not.
    let locs = locations();
    let slow = Some(StoreFault::Delay(Duration::from_millis(600)));
    store.set_fault(&locs[0], slow).await;
    store.set_fault(&locs[1], slow).await;

    let err = service.turn_replica_off("acct1").await.unwrap_err();
    match err {
        Error::ReplicaOperation { stage, result, .. } => {
            assert_eq!(stage, rtconfig::error::OperationStage::Write);
            assert_eq!(
                result,
                rtconfig::error::StageResult::Write(QuorumWriteResult::NetworkError)
            );
        }
        other => panic!("unexpected error: {}", other),
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_quorum_survives_one_location() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    let mut config = bootstrap(&service).await;

    let locs = locations();
    store.set_fault(&locs[2], Some(StoreFault::Unreachable)).await;

    config.view_map.get_mut("view1").unwrap().view_id = 0;
    assert_eq!(
        service
            .update_configuration(&mut config, UpdateMode::Conditional)
            .await
            .unwrap(),
        QuorumWriteResult::Success
    );

    let (result, read) = service.retrieve_configuration().await;
    assert_eq!(result, QuorumReadResult::Success);
    assert_eq!(read.unwrap().id, config.id);

    let all = service.retrieve_all_configurations().await;
    assert_eq!(all.len(), 3);
    assert_eq!(service.populated_locations().await, locs[..2].to_vec());

    store.set_fault(&locs[2], None).await;
    assert_eq!(service.populated_locations().await.len(), 3);

    service.shutdown().await;
}

#[tokio::test]
async fn test_invalid_configuration_rejected() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);

    let mut config = Configuration::new();
    config.set_configured_table(ConfiguredTable::new("orders", "missing-view"));
    let err = service
        .update_configuration(&mut config, UpdateMode::Conditional)
        .await
        .unwrap_err();
    assert!(err.is_argument_error());
    assert!(store.get_raw(&locations()[0]).await.is_none());

    service.turn_replica_on("acct1");
    service.shutdown().await;
}

#[tokio::test]
async fn test_drained_chain_keeps_view_id_increasing() {
    let store = Arc::new(MemoryBlobStore::new());
    let service = service(&store);
    let mut config = bootstrap(&service).await;

    for _ in 0..3 {
        config.view_map.get_mut("view1").unwrap().view_id = 0;
        service
            .update_configuration(&mut config, UpdateMode::Conditional)
            .await
            .unwrap();
    }
    assert_eq!(service.get_view("view1").await.view_id, 4);

    let mut ids = Vec::new();
    for _ in 0..2 {
        let view = config.view_map.get_mut("view1").unwrap();
        view.view_id = 0;
        view.replica_chain.clear();
        let result = service
            .update_configuration(&mut config, UpdateMode::Conditional)
            .await
            .unwrap();
        assert_eq!(result, QuorumWriteResult::Success);
        ids.push(service.get_view("view1").await.view_id);
    }
    assert_eq!(ids, vec![5, 6]);

    service.shutdown().await;
}

#[tokio::test]
async fn test_unreadable_views_block_update() {
    let store = Arc::new(FlakyReads::new());
    let service = ConfigurationService::with_store(
        locations(),
        false,
        1,
        Duration::from_secs(3600),
        store.clone(),
    )
    .unwrap();
    // Keep background refreshes from consuming the failing reads.
    service.manager().stop_monitor().await;
    let mut config = bootstrap(&service).await;

    config.view_map.get_mut("view1").unwrap().view_id = 0;
    service
        .update_configuration(&mut config, UpdateMode::Conditional)
        .await
        .unwrap();
    assert_eq!(service.get_view("view1").await.view_id, 2);

    store.fail_next(3);
    let mut candidate = config.clone();
    candidate.view_map.get_mut("view1").unwrap().view_id = 0;
    let err = service
        .update_configuration(&mut candidate, UpdateMode::Conditional)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuorumRead(QuorumReadResult::Unreachable)));
    assert!(err.is_retryable());
    assert_eq!(service.get_view("view1").await.view_id, 2);

    let mut retry = config.clone();
    retry.view_map.get_mut("view1").unwrap().view_id = 0;
    assert_eq!(
        service
            .update_configuration(&mut retry, UpdateMode::Conditional)
            .await
            .unwrap(),
        QuorumWriteResult::Success
    );
    assert_eq!(service.get_view("view1").await.view_id, 3);

    service.shutdown().await;
}

#[tokio::test]
async fn test_stale_cache_does_not_lower_view_id() {
    let store = Arc::new(MemoryBlobStore::new());
    let first = service(&store);
    let second = service(&store);
    first.manager().stop_monitor().await;
    second.manager().stop_monitor().await;
    let config = bootstrap(&first).await;

    // Warm the first service's cache, then move the view on through the second.
    assert_eq!(first.get_view("view1").await.view_id, 1);
    let mut newer = config.clone();
    for _ in 0..3 {
        newer.view_map.get_mut("view1").unwrap().view_id = 0;
        second
            .update_configuration(&mut newer, UpdateMode::Conditional)
            .await
            .unwrap();
    }
    assert_eq!(second.get_view("view1").await.view_id, 4);
    assert_eq!(first.get_view("view1").await.view_id, 1, "served from cache");

    let mut stale = config.clone();
    stale.view_map.get_mut("view1").unwrap().view_id = 0;
    assert_eq!(
        first
            .update_configuration(&mut stale, UpdateMode::Unconditional)
            .await
            .unwrap(),
        QuorumWriteResult::Success
    );
    assert_eq!(stale.view("view1").unwrap().view_id, 5);
    assert_eq!(second.retrieve_configuration().await.1.unwrap().view("view1").unwrap().view_id, 5);

    first.shutdown().await;
    second.shutdown().await;
}
