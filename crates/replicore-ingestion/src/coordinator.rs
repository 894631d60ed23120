//! Leader/Follower Role Coordinator
//!
//! Host-level entry point. Starts and stops partition replicas and routes
//! role changes to them.
//!
//! ## Ownership
//!
//! Each replica runs as its own task ([`PartitionConsumer`]). The coordinator
//! keeps only a handle per replica: a command channel, a status watch and the
//! join handle. Role changes are queued on the command channel and applied by
//! the replica at its next safe point, so they never interleave with a batch.
//!
//! ## Restart
//!
//! A replica that halted in `ERROR` is replaced on the next
//! [`start_partition`](Coordinator::start_partition); starting resets the
//! version's errored gauge.
//!
//! ## Example
//!
//! ```rust,no_run
//! use replicore_ingestion::{Coordinator, MemoryLog, MemoryStorage, StoreVersionConfig};
//! use replicore_core::{ReplicaId, Role};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::builder()
//!     .source(Arc::new(MemoryLog::new()))
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .build()?;
//!
//! let replica = ReplicaId::new("orders", 1, 0);
//! coordinator
//!     .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
//!     .await?;
//! coordinator.change_role(&replica, Role::Leader).await?;
//! coordinator.stop_partition(&replica).await?;
//! # Ok(())
//! # }
//! ```

use crate::cache::HandleCache;
use crate::config::{IngestionConfig, StoreVersionConfig};
use crate::error::{IngestionError, Result};
use crate::replica::{PartitionConsumer, ReplicaCommand, ReplicaContext, ReplicaState, ReplicaStatus};
use crate::source::IngestionSource;
use crate::storage::StorageEngine;
use replicore_core::{ReplicaId, Role};
use replicore_observability::metrics::REPLICAS_ACTIVE;
use replicore_observability::IngestionStatsAggregator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

struct ReplicaHandle {
    config: StoreVersionConfig,
    commands: mpsc::Sender<ReplicaCommand>,
    status: watch::Receiver<ReplicaStatus>,
    task: JoinHandle<()>,
}

impl ReplicaHandle {
    /// Still consuming: neither finished nor halted in `ERROR`.
    fn is_running(&self) -> bool {
        !self.task.is_finished() && self.status.borrow().state != ReplicaState::Error
    }
}

pub struct Coordinator {
    context: ReplicaContext,
    replicas: RwLock<HashMap<ReplicaId, ReplicaHandle>>,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.context.config
    }

    pub fn stats(&self) -> Arc<IngestionStatsAggregator> {
        Arc::clone(&self.context.stats)
    }

    /// Start consuming a replica in the given role.
    ///
    /// Idempotent for a replica already running with the same configuration.
    /// A running replica with a different configuration is rejected.
    pub async fn start_partition(
        &self,
        replica: ReplicaId,
        config: StoreVersionConfig,
        role: Role,
    ) -> Result<()> {
        config.validate()?;
        let mut replicas = self.replicas.write().await;

        if let Some(existing) = replicas.get(&replica) {
            if existing.is_running() {
                if existing.config == config {
                    debug!(replica = %replica, "Replica already running");
                    return Ok(());
                }
                return Err(IngestionError::Configuration(format!(
                    "replica {} is already running with a different configuration",
                    replica
                )));
            }
        }

        if let Some(halted) = replicas.remove(&replica) {
            info!(replica = %replica, "Replacing halted replica");
            Self::stop_handle(&replica, halted).await?;
        }

        let stats = &self.context.stats;
        stats.register_replica(&replica.store, replica.version, &config.profile());
        stats.reset_errored(&replica.store, replica.version);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ReplicaStatus::new(role));
        let consumer = PartitionConsumer::new(
            replica.clone(),
            config.clone(),
            role,
            self.context.clone(),
            command_rx,
            status_tx,
        );
        let task = tokio::spawn(consumer.run());
        REPLICAS_ACTIVE.inc();

        info!(replica = %replica, role = %role, "Started partition");
        replicas.insert(
            replica,
            ReplicaHandle {
                config,
                commands: command_tx,
                status: status_rx,
                task,
            },
        );
        Ok(())
    }

    /// Stop a replica and wait for its task to finish. Unknown replicas are
    /// ignored.
    pub async fn stop_partition(&self, replica: &ReplicaId) -> Result<()> {
        let handle = self.replicas.write().await.remove(replica);
        match handle {
            Some(handle) => Self::stop_handle(replica, handle).await,
            None => {
                debug!(replica = %replica, "Stop requested for replica that is not running");
                Ok(())
            }
        }
    }

    async fn stop_handle(replica: &ReplicaId, handle: ReplicaHandle) -> Result<()> {
        // The task may already be gone; the join below still reaps it.
        let _ = handle.commands.send(ReplicaCommand::Stop).await;
        let result = handle.task.await;
        REPLICAS_ACTIVE.dec();
        result?;
        info!(replica = %replica, "Stopped partition");
        Ok(())
    }

    /// Queue a role change. The replica applies it at its next safe point.
    ///
    /// A change for a replica this host does not run is recorded as a stale
    /// partition and otherwise ignored.
    pub async fn change_role(&self, replica: &ReplicaId, role: Role) -> Result<()> {
        // Sent without the map lock: a full queue must not block start and stop.
        let commands = self
            .replicas
            .read()
            .await
            .get(replica)
            .map(|handle| handle.commands.clone());
        let delivered = match commands {
            Some(commands) => commands.send(ReplicaCommand::ChangeRole(role)).await.is_ok(),
            None => false,
        };

        if delivered {
            debug!(replica = %replica, role = %role, "Queued role change");
        } else {
            warn!(replica = %replica, role = %role, "Role change for replica that is not running");
            self.context
                .stats
                .record_stale_partition(&replica.store, replica.version);
        }
        Ok(())
    }

    pub async fn status(&self, replica: &ReplicaId) -> Option<ReplicaStatus> {
        self.replicas
            .read()
            .await
            .get(replica)
            .map(|handle| handle.status.borrow().clone())
    }

    /// Status stream of a replica, updated after every cycle.
    pub async fn subscribe_status(&self, replica: &ReplicaId) -> Option<watch::Receiver<ReplicaStatus>> {
        self.replicas
            .read()
            .await
            .get(replica)
            .map(|handle| handle.status.clone())
    }

    pub async fn is_ready(&self, replica: &ReplicaId) -> bool {
        self.status(replica).await.map(|s| s.ready).unwrap_or(false)
    }

    pub async fn replicas(&self) -> Vec<ReplicaId> {
        let mut replicas: Vec<_> = self.replicas.read().await.keys().cloned().collect();
        replicas.sort();
        replicas
    }

    /// Every replica on this host is serving reads. Never blocks; reports
    /// not-ready while the replica table is being modified.
    pub fn all_ready_now(&self) -> bool {
        match self.replicas.try_read() {
            Ok(replicas) => replicas.values().all(|h| h.status.borrow().ready),
            Err(_) => false,
        }
    }

    /// Stop every replica.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<_> = self.replicas.write().await.drain().collect();
        info!(replicas = handles.len(), "Shutting down coordinator");
        for (replica, handle) in handles {
            Self::stop_handle(&replica, handle).await?;
        }
        Ok(())
    }
}

/// Builder for Coordinator
pub struct CoordinatorBuilder {
    config: IngestionConfig,
    source: Option<Arc<dyn IngestionSource>>,
    storage: Option<Arc<dyn StorageEngine>>,
    stats: Option<Arc<IngestionStatsAggregator>>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: IngestionConfig::default(),
            source: None,
            storage: None,
            stats: None,
        }
    }

    pub fn config(mut self, config: IngestionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(mut self, source: Arc<dyn IngestionSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageEngine>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Share an existing aggregator; by default one is created for the
    /// configured local region.
    pub fn stats(mut self, stats: Arc<IngestionStatsAggregator>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;

        let source = self
            .source
            .ok_or_else(|| IngestionError::Configuration("source is required".to_string()))?;
        let storage = self
            .storage
            .ok_or_else(|| IngestionError::Configuration("storage is required".to_string()))?;
        let stats = self.stats.unwrap_or_else(|| {
            Arc::new(IngestionStatsAggregator::new(self.config.local_region.clone()))
        });
        let producers = HandleCache::new(Arc::clone(&source), self.config.producer_cache_capacity);

        Ok(Coordinator {
            context: ReplicaContext {
                config: Arc::new(self.config),
                source,
                storage,
                stats,
                producers,
            },
            replicas: RwLock::new(HashMap::new()),
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryLog;
    use crate::storage::MemoryStorage;
    use replicore_observability::names::STALE_PARTITIONS_WITHOUT_INGESTION_TASK;
    use replicore_observability::StatsScope;

    fn coordinator() -> Coordinator {
        Coordinator::builder()
            .source(Arc::new(MemoryLog::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_source_and_storage() {
        let result = Coordinator::builder()
            .storage(Arc::new(MemoryStorage::new()))
            .build();
        assert!(matches!(result, Err(IngestionError::Configuration(_))));

        let result = Coordinator::builder()
            .source(Arc::new(MemoryLog::new()))
            .build();
        assert!(matches!(result, Err(IngestionError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_rejects_config_change() {
        let coordinator = coordinator();
        let replica = ReplicaId::new("orders", 1, 0);

        coordinator
            .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
            .await
            .unwrap();
        coordinator
            .start_partition(replica.clone(), StoreVersionConfig::default(), Role::Standby)
            .await
            .unwrap();
        assert_eq!(coordinator.replicas().await, vec![replica.clone()]);

        let hybrid = StoreVersionConfig {
            hybrid: Some(crate::config::HybridConfig {
                rewind_seconds: 60,
                offset_lag_threshold: 10,
            }),
            ..Default::default()
        };
        let result = coordinator.start_partition(replica.clone(), hybrid, Role::Standby).await;
        assert!(matches!(result, Err(IngestionError::Configuration(_))));

        coordinator.shutdown().await.unwrap();
        assert!(coordinator.replicas().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_replica_is_noop() {
        let coordinator = coordinator();
        coordinator
            .stop_partition(&ReplicaId::new("orders", 1, 3))
            .await
            .unwrap();
        assert!(coordinator.status(&ReplicaId::new("orders", 1, 3)).await.is_none());
    }

    #[tokio::test]
    async fn test_role_change_for_unknown_replica_records_stale_partition() {
        let coordinator = coordinator();
        let running = ReplicaId::new("orders", 1, 0);
        coordinator
            .start_partition(running.clone(), StoreVersionConfig::default(), Role::Standby)
            .await
            .unwrap();

        coordinator
            .change_role(&ReplicaId::new("orders", 1, 7), Role::Leader)
            .await
            .unwrap();

        let stale = coordinator.stats().read_gauge(
            "orders",
            StatsScope::Version(1),
            STALE_PARTITIONS_WITHOUT_INGESTION_TASK,
        );
        assert_eq!(stale, Some(1.0));

        coordinator.stop_partition(&running).await.unwrap();
    }

    #[tokio::test]
    async fn test_blocked_role_change_does_not_block_start() {
        let coordinator = Arc::new(coordinator());

        // A replica that never reaches its safe point, with a full command queue
        let busy = ReplicaId::new("orders", 1, 0);
        let (command_tx, _command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        for _ in 0..COMMAND_CHANNEL_CAPACITY {
            command_tx
                .try_send(ReplicaCommand::ChangeRole(Role::Standby))
                .unwrap();
        }
        let (_status_tx, status_rx) = watch::channel(ReplicaStatus::new(Role::Standby));
        coordinator.replicas.write().await.insert(
            busy.clone(),
            ReplicaHandle {
                config: StoreVersionConfig::default(),
                commands: command_tx,
                status: status_rx,
                task: tokio::spawn(std::future::pending::<()>()),
            },
        );

        let blocked = {
            let coordinator = Arc::clone(&coordinator);
            let busy = busy.clone();
            tokio::spawn(async move { coordinator.change_role(&busy, Role::Leader).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let other = ReplicaId::new("orders", 1, 1);
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            coordinator.start_partition(other.clone(), StoreVersionConfig::default(), Role::Standby),
        )
        .await
        .expect("start blocked behind a pending role change")
        .unwrap();
        assert_eq!(coordinator.replicas().await, vec![busy.clone(), other.clone()]);

        blocked.abort();
        if let Some(handle) = coordinator.replicas.write().await.remove(&busy) {
            handle.task.abort();
        }
        coordinator.stop_partition(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_ready_now_with_no_replicas() {
        let coordinator = coordinator();
        assert!(coordinator.all_ready_now());
    }
}
