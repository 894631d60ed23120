//! Ingestion Source
//!
//! The partitioned change log a replica consumes from and the leader
//! re-publishes into.
//!
//! ## Traits
//!
//! - [`IngestionSource`]: hands out consumers and producers, answers offset queries
//! - [`SourceConsumer`]: one replica's subscription set and poll loop
//! - [`LogProducer`]: appends records to a topic
//!
//! Offsets follow the *next offset* convention: `end_offset` is the offset the
//! next appended record will get, and `subscribe(tp, offset)` delivers records
//! starting at `offset`.
//!
//! ## In-Memory Log
//!
//! [`MemoryLog`] implements all three traits over an in-process map of
//! partitions. It is used by the simulation binary and the tests, and can be
//! made temporarily unavailable to exercise retry paths.

use crate::error::{IngestionError, Result};
use async_trait::async_trait;
use replicore_core::{ChangeRecord, ReplicaId, TopicPartition};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Current timestamp in milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
pub trait IngestionSource: Send + Sync {
    /// A fresh consumer with no subscriptions.
    async fn acquire_consumer(&self, replica: &ReplicaId) -> Result<Box<dyn SourceConsumer>>;

    /// Offset the next appended record will get.
    async fn end_offset(&self, tp: &TopicPartition) -> Result<u64>;

    /// First offset whose record timestamp is at or after `timestamp_ms`, or the
    /// end offset when there is none.
    async fn offset_for_timestamp(&self, tp: &TopicPartition, timestamp_ms: u64) -> Result<u64>;

    async fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>>;
}

#[async_trait]
pub trait SourceConsumer: Send {
    async fn subscribe(&mut self, tp: &TopicPartition, offset: u64) -> Result<()>;

    async fn unsubscribe(&mut self, tp: &TopicPartition) -> Result<()>;

    /// Up to `max_records` records across every subscription, in offset order
    /// per partition.
    async fn poll(&mut self, max_records: usize) -> Result<Vec<(TopicPartition, ChangeRecord)>>;
}

#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Append `record` and return the offset it was written at.
    async fn produce(&self, partition: u32, record: ChangeRecord) -> Result<u64>;
}

#[derive(Default)]
struct LogState {
    partitions: HashMap<TopicPartition, Vec<ChangeRecord>>,
}

/// In-process partitioned log. Clones share the same partitions.
#[derive(Clone, Default)]
pub struct MemoryLog {
    state: Arc<RwLock<LogState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, overwriting its offset with the assigned one.
    pub async fn append(&self, tp: &TopicPartition, mut record: ChangeRecord) -> u64 {
        let mut state = self.state.write().await;
        let records = state.partitions.entry(tp.clone()).or_default();
        let offset = records.len() as u64;
        record.offset = offset;
        records.push(record);
        offset
    }

    pub async fn records(&self, tp: &TopicPartition) -> Vec<ChangeRecord> {
        self.state
            .read()
            .await
            .partitions
            .get(tp)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every call fail with `SourceUnavailable` until restored.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(IngestionError::SourceUnavailable(
                "log is unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IngestionSource for MemoryLog {
    async fn acquire_consumer(&self, _replica: &ReplicaId) -> Result<Box<dyn SourceConsumer>> {
        self.check_available()?;
        Ok(Box::new(MemoryConsumer {
            log: self.clone(),
            positions: BTreeMap::new(),
        }))
    }

    async fn end_offset(&self, tp: &TopicPartition) -> Result<u64> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .partitions
            .get(tp)
            .map(|records| records.len() as u64)
            .unwrap_or(0))
    }

    async fn offset_for_timestamp(&self, tp: &TopicPartition, timestamp_ms: u64) -> Result<u64> {
        self.check_available()?;
        let state = self.state.read().await;
        let Some(records) = state.partitions.get(tp) else {
            return Ok(0);
        };
        Ok(records
            .iter()
            .find(|r| r.timestamp >= timestamp_ms)
            .map(|r| r.offset)
            .unwrap_or(records.len() as u64))
    }

    async fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>> {
        self.check_available()?;
        Ok(Arc::new(MemoryProducer {
            log: self.clone(),
            topic: topic.to_string(),
        }))
    }
}

struct MemoryConsumer {
    log: MemoryLog,
    positions: BTreeMap<TopicPartition, u64>,
}

#[async_trait]
impl SourceConsumer for MemoryConsumer {
    async fn subscribe(&mut self, tp: &TopicPartition, offset: u64) -> Result<()> {
        self.log.check_available()?;
        self.positions.insert(tp.clone(), offset);
        Ok(())
    }

    async fn unsubscribe(&mut self, tp: &TopicPartition) -> Result<()> {
        self.positions.remove(tp);
        Ok(())
    }

    async fn poll(&mut self, max_records: usize) -> Result<Vec<(TopicPartition, ChangeRecord)>> {
        self.log.check_available()?;
        let state = self.log.state.read().await;
        let mut batch = Vec::new();

        for (tp, position) in self.positions.iter_mut() {
            let Some(records) = state.partitions.get(tp) else {
                continue;
            };
            let start = (*position as usize).min(records.len());
            let take = (max_records - batch.len()).min(records.len() - start);
            for record in &records[start..start + take] {
                batch.push((tp.clone(), record.clone()));
            }
            *position += take as u64;
            if batch.len() >= max_records {
                break;
            }
        }

        Ok(batch)
    }
}

struct MemoryProducer {
    log: MemoryLog,
    topic: String,
}

#[async_trait]
impl LogProducer for MemoryProducer {
    async fn produce(&self, partition: u32, record: ChangeRecord) -> Result<u64> {
        self.log.check_available()?;
        let tp = TopicPartition::new(self.topic.clone(), partition);
        Ok(self.log.append(&tp, record).await)
    }
}
