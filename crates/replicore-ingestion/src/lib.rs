//! Replicore Ingestion - Partition Consumption and Role Coordination
//!
//! Runs the partition replicas of a storage host: consumes batch pushes and
//! real-time change streams, merges partial updates, re-publishes as leader and
//! reports lag and readiness.
//!
//! ## Components
//!
//! - **Coordinator**: starts and stops replicas, routes role changes
//! - **PartitionConsumer**: the per-replica consumption state machine
//! - **IngestionSource** / **StorageEngine**: the log and the local store,
//!   with in-memory implementations for simulation and tests
//! - **HandleCache**: shared version-topic producer handles
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use replicore_ingestion::{Coordinator, HybridConfig, MemoryLog, MemoryStorage, StoreVersionConfig};
//! use replicore_core::{ReplicaId, Role};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = Coordinator::builder()
//!     .source(Arc::new(MemoryLog::new()))
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .build()?;
//!
//! let version = StoreVersionConfig {
//!     hybrid: Some(HybridConfig { rewind_seconds: 3600, offset_lag_threshold: 1000 }),
//!     ..Default::default()
//! };
//! coordinator
//!     .start_partition(ReplicaId::new("orders", 1, 0), version, Role::Leader)
//!     .await?;
//!
//! // ... serve reads once ready ...
//!
//! coordinator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod replica;
pub mod source;
pub mod storage;

pub use cache::HandleCache;
pub use config::{HybridConfig, IngestionConfig, StoreVersionConfig};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{IngestionError, Result};
pub use replica::{PartitionConsumer, ReplicaCommand, ReplicaState, ReplicaStatus};
pub use source::{current_timestamp_ms, IngestionSource, LogProducer, MemoryLog, SourceConsumer};
pub use storage::{Checkpoint, MemoryStorage, StorageEngine};
