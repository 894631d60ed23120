//! Consumption Lifecycle Integration Tests
//!
//! Tests that drive a single replica through its lifecycle:
//! - Batch push bootstraps to ONLINE and commits a checkpoint
//! - Processing errors before end of push are retried, never flagged
//! - Processing errors after end of push halt the replica until restarted
//! - Restart resumes from the checkpoint
//! - Push timeout and stale source are reported without stopping consumption

use bytes::Bytes;
use replicore_core::{ChangeRecord, ControlMessage, ReplicaId, Role};
use replicore_ingestion::{
    current_timestamp_ms, Coordinator, IngestionConfig, MemoryLog, MemoryStorage, ReplicaState,
    ReplicaStatus, StorageEngine, StoreVersionConfig,
};
use replicore_observability::names::{
    INGESTION_TASK_ERRORED_GAUGE, INGESTION_TASK_PUSH_TIMEOUT_GAUGE,
    STALE_PARTITIONS_WITHOUT_INGESTION_TASK,
};
use replicore_observability::StatsScope;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> IngestionConfig {
    IngestionConfig {
        poll_interval: Duration::from_millis(5),
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        ..Default::default()
    }
}

fn coordinator(config: IngestionConfig, log: &MemoryLog, storage: &MemoryStorage) -> Coordinator {
    Coordinator::builder()
        .config(config)
        .source(Arc::new(log.clone()))
        .storage(Arc::new(storage.clone()))
        .build()
        .unwrap()
}

/// `records` version-topic records: start of push at offset 0, end of push at
/// `end_of_push_at`, a put of `key-{offset}` everywhere else.
async fn seed_stream(log: &MemoryLog, replica: &ReplicaId, records: u64, end_of_push_at: Option<u64>) {
    let vt = replica.version_topic();
    let now = current_timestamp_ms();
    for offset in 0..records {
        let record = if offset == 0 {
            ChangeRecord::control(0, now, ControlMessage::StartOfPush)
        } else if Some(offset) == end_of_push_at {
            ChangeRecord::control(0, now, ControlMessage::EndOfPush)
        } else {
            ChangeRecord::put(
                0,
                now,
                Bytes::from(format!("key-{}", offset)),
                Bytes::from(format!(r#"{{"id":{}}}"#, offset)),
            )
        };
        log.append(&vt, record).await;
    }
}

async fn wait_for_status(
    coordinator: &Coordinator,
    replica: &ReplicaId,
    condition: impl FnMut(&ReplicaStatus) -> bool,
) -> ReplicaStatus {
    let mut status = coordinator
        .subscribe_status(replica)
        .await
        .expect("replica is running");
    let status = tokio::time::timeout(Duration::from_secs(10), status.wait_for(condition))
        .await
        .expect("timed out waiting for replica status")
        .expect("replica task ended")
        .clone();
    status
}

async fn wait_for_len(storage: &MemoryStorage, replica: &ReplicaId, expected: usize) {
    for _ in 0..1000 {
        if storage.len(replica).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("storage never reached {} values", expected);
}

/// Test that a batch push bootstraps a standby to ONLINE
#[tokio::test]
async fn test_batch_push_reaches_online() {
    let log = MemoryLog::new();
    let storage = MemoryStorage::new();
    let replica = ReplicaId::new("batch_store", 1, 0);
    seed_stream(&log, &replica, 102, Some(101)).await;

    let coordinator = coordinator(fast_config(), &log, &storage);
    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();

    let status = wait_for_status(&coordinator, &replica, |s| s.state == ReplicaState::Online).await;
    assert!(status.ready);
    assert!(!status.errored);
    assert!(status.lag.end_of_push_received);
    assert_eq!(status.lag.follower_batch_lag, 0);
    assert!(coordinator.is_ready(&replica).await);

    assert_eq!(storage.len(&replica).await, 100);
    let checkpoint = storage.checkpoint(&replica).await.unwrap().unwrap();
    assert_eq!(checkpoint.version_topic_offset, 102);
    assert!(checkpoint.end_of_push_received);

    coordinator.stop_partition(&replica).await.unwrap();
    assert!(coordinator.status(&replica).await.is_none());
}

/// Test that a failure at record 50 of a 200-record stream, before end of push, is retried
#[tokio::test]
async fn test_error_before_end_of_push_is_retried() {
    let log = MemoryLog::new();
    let storage = MemoryStorage::new();
    let replica = ReplicaId::new("retry_store", 1, 0);
    seed_stream(&log, &replica, 200, Some(100)).await;
    storage.fail_writes_at(50, 1).await;

    let coordinator = coordinator(fast_config(), &log, &storage);
    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();

    let status = wait_for_status(&coordinator, &replica, |s| s.state == ReplicaState::Online).await;
    assert!(!status.errored);
    assert_eq!(storage.len(&replica).await, 198);

    let errored = coordinator.stats().read_gauge(
        "retry_store",
        StatsScope::Version(1),
        INGESTION_TASK_ERRORED_GAUGE,
    );
    assert_eq!(errored, Some(0.0));

    coordinator.shutdown().await.unwrap();
}

/// Test that a failure at record 150, after end of push, halts the replica until it is restarted
#[tokio::test]
async fn test_error_after_end_of_push_halts_until_restart() {
    let log = MemoryLog::new();
    let storage = MemoryStorage::new();
    let replica = ReplicaId::new("halt_store", 1, 0);
    seed_stream(&log, &replica, 200, Some(100)).await;
    storage.fail_writes_at(150, 1).await;

    let config = IngestionConfig {
        poll_batch_size: 20,
        ..fast_config()
    };
    let coordinator = coordinator(config, &log, &storage);
    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();

    let status = wait_for_status(&coordinator, &replica, |s| s.state == ReplicaState::Error).await;
    assert!(status.errored);
    assert!(!status.ready);

    let stats = coordinator.stats();
    assert_eq!(
        stats.read_gauge("halt_store", StatsScope::Version(1), INGESTION_TASK_ERRORED_GAUGE),
        Some(1.0)
    );
    // Errored is a version-level signal only
    assert_eq!(
        stats.read_gauge("halt_store", StatsScope::Total, INGESTION_TASK_ERRORED_GAUGE),
        Some(0.0)
    );

    // The partition stops advancing at the failed batch
    let checkpoint = storage.checkpoint(&replica).await.unwrap().unwrap();
    assert_eq!(checkpoint.version_topic_offset, 140);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.checkpoint(&replica).await.unwrap().unwrap(), checkpoint);
    assert_eq!(storage.get(&replica, b"key-160").await.unwrap(), None);

    // Role changes are ignored while halted
    coordinator.change_role(&replica, Role::Leader).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = coordinator.status(&replica).await.unwrap();
    assert_eq!(status.state, ReplicaState::Error);
    assert_eq!(status.role, Role::Standby);

    // Starting again replaces the halted replica and clears the gauge
    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();
    let status = wait_for_status(&coordinator, &replica, |s| s.state == ReplicaState::Online).await;
    assert!(!status.errored);
    assert_eq!(
        stats.read_gauge("halt_store", StatsScope::Version(1), INGESTION_TASK_ERRORED_GAUGE),
        Some(0.0)
    );
    wait_for_len(&storage, &replica, 198).await;

    coordinator.shutdown().await.unwrap();
}

/// Test that a restarted replica resumes from its checkpoint instead of replaying
#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let log = MemoryLog::new();
    let storage = MemoryStorage::new();
    let replica = ReplicaId::new("resume_store", 1, 0);
    seed_stream(&log, &replica, 22, Some(21)).await;

    let coordinator = coordinator(fast_config(), &log, &storage);
    let version = StoreVersionConfig::default();
    coordinator
        .start_partition(replica.clone(), version.clone(), Role::Standby)
        .await
        .unwrap();
    wait_for_status(&coordinator, &replica, |s| s.state == ReplicaState::Online).await;
    coordinator.stop_partition(&replica).await.unwrap();

    // Replaying offset 5 after end of push would halt the replica
    storage.fail_writes_at(5, 1).await;

    coordinator
        .start_partition(replica.clone(), version, Role::Standby)
        .await
        .unwrap();
    let status = wait_for_status(&coordinator, &replica, |s| s.state == ReplicaState::Online).await;
    assert!(!status.errored);
    assert!(status.lag.end_of_push_received);

    coordinator.shutdown().await.unwrap();
}

/// Test that a missing end of push raises the push-timeout flag while consumption continues
#[tokio::test]
async fn test_push_timeout_is_reported() {
    let log = MemoryLog::new();
    let storage = MemoryStorage::new();
    let replica = ReplicaId::new("slow_push_store", 1, 0);
    seed_stream(&log, &replica, 11, None).await;

    let config = IngestionConfig {
        bootstrap_timeout: Duration::from_millis(30),
        ..fast_config()
    };
    let coordinator = coordinator(config, &log, &storage);
    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();

    let status = wait_for_status(&coordinator, &replica, |s| s.push_timeout).await;
    assert_eq!(status.state, ReplicaState::Bootstrapping);
    assert!(!status.errored);
    assert_eq!(
        coordinator.stats().read_gauge(
            "slow_push_store",
            StatsScope::Version(1),
            INGESTION_TASK_PUSH_TIMEOUT_GAUGE
        ),
        Some(1.0)
    );

    // The push completes late; the replica still comes online
    log.append(
        &replica.version_topic(),
        ChangeRecord::control(0, current_timestamp_ms(), ControlMessage::EndOfPush),
    )
    .await;
    let status = wait_for_status(&coordinator, &replica, |s| s.state == ReplicaState::Online).await;
    assert!(status.push_timeout);
    assert_eq!(storage.len(&replica).await, 10);

    coordinator.shutdown().await.unwrap();
}

/// Test that an unavailable source marks the replica stale and recovery clears it
#[tokio::test]
async fn test_unavailable_source_marks_replica_stale() {
    let log = MemoryLog::new();
    let storage = MemoryStorage::new();
    let replica = ReplicaId::new("stale_store", 1, 0);
    seed_stream(&log, &replica, 12, Some(11)).await;
    log.set_available(false);

    let config = IngestionConfig {
        stale_grace: Duration::ZERO,
        ..fast_config()
    };
    let coordinator = coordinator(config, &log, &storage);
    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();

    let status = wait_for_status(&coordinator, &replica, |s| s.stale).await;
    assert!(!status.errored);
    assert_eq!(
        coordinator.stats().read_gauge(
            "stale_store",
            StatsScope::Version(1),
            STALE_PARTITIONS_WITHOUT_INGESTION_TASK
        ),
        Some(1.0)
    );

    log.set_available(true);
    let status = wait_for_status(&coordinator, &replica, |s| {
        !s.stale && s.state == ReplicaState::Online
    })
    .await;
    assert!(!status.errored);
    assert_eq!(storage.len(&replica).await, 10);

    coordinator.shutdown().await.unwrap();
}

/// Test that a record that keeps failing before end of push still raises the push-timeout flag
#[tokio::test]
async fn test_stuck_bootstrap_raises_push_timeout() {
    let log = MemoryLog::new();
    let storage = MemoryStorage::new();
    let replica = ReplicaId::new("stuck_push_store", 1, 0);
    seed_stream(&log, &replica, 20, Some(19)).await;
    storage.fail_writes_at(5, usize::MAX).await;

    let config = IngestionConfig {
        bootstrap_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let coordinator = coordinator(config, &log, &storage);
    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();

    let status = wait_for_status(&coordinator, &replica, |s| s.push_timeout).await;
    assert_eq!(status.state, ReplicaState::Bootstrapping);
    assert!(!status.errored);
    assert_eq!(
        coordinator.stats().read_gauge(
            "stuck_push_store",
            StatsScope::Version(1),
            INGESTION_TASK_PUSH_TIMEOUT_GAUGE
        ),
        Some(1.0)
    );

    // Still retrying, so a stop interrupts the backoff
    coordinator.stop_partition(&replica).await.unwrap();
    assert!(coordinator.status(&replica).await.is_none());
}

/// Test that a source outage during bootstrap still raises the push-timeout flag
#[tokio::test]
async fn test_unavailable_source_during_bootstrap_raises_push_timeout() {
    let log = MemoryLog::new();
    let storage = MemoryStorage::new();
    let replica = ReplicaId::new("dark_push_store", 1, 0);
    seed_stream(&log, &replica, 12, Some(11)).await;
    log.set_available(false);

    let config = IngestionConfig {
        bootstrap_timeout: Duration::from_millis(30),
        ..fast_config()
    };
    let coordinator = coordinator(config, &log, &storage);
    coordinator
        .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
        .await
        .unwrap();

    let status = wait_for_status(&coordinator, &replica, |s| s.push_timeout).await;
    assert!(!status.errored);
    assert_ne!(status.state, ReplicaState::Online);

    log.set_available(true);
    let status = wait_for_status(&coordinator, &replica, |s| s.state == ReplicaState::Online).await;
    assert!(status.push_timeout);
    assert_eq!(storage.len(&replica).await, 10);

    coordinator.shutdown().await.unwrap();
}
