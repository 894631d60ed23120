//! Storage Engine
//!
//! Where replicas persist merged values and their consumption checkpoint.
//!
//! ## Write Ordering
//!
//! Every write carries the source offset it was derived from. A write whose
//! offset is lower than the one already stored for the key is ignored
//! (last-write-wins by source offset), so replaying a partition from an older
//! checkpoint is harmless.
//!
//! ## Checkpoints
//!
//! A [`Checkpoint`] is committed once per processed batch. It records the next
//! version-topic offset, the control messages already seen and the upstream
//! positions learned so far; a restarted replica resumes from it.

use crate::error::{IngestionError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use replicore_core::{ReplicaId, UpstreamPosition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Durable consumption position of one replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Next version-topic offset to consume
    pub version_topic_offset: u64,
    #[serde(default)]
    pub end_of_push_received: bool,
    #[serde(default)]
    pub start_of_buffer_replay_received: bool,
    /// Next upstream offset per region
    #[serde(default)]
    pub upstream: Vec<UpstreamPosition>,
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn get(&self, replica: &ReplicaId, key: &[u8]) -> Result<Option<Bytes>>;

    async fn put(&self, replica: &ReplicaId, key: Bytes, value: Bytes, offset: u64) -> Result<()>;

    async fn delete(&self, replica: &ReplicaId, key: Bytes, offset: u64) -> Result<()>;

    async fn checkpoint(&self, replica: &ReplicaId) -> Result<Option<Checkpoint>>;

    async fn commit_checkpoint(&self, replica: &ReplicaId, checkpoint: Checkpoint) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    /// `None` for a tombstone
    value: Option<Bytes>,
    offset: u64,
}

#[derive(Default)]
struct ReplicaData {
    values: HashMap<Bytes, StoredValue>,
    checkpoint: Option<Checkpoint>,
}

#[derive(Default)]
struct StorageState {
    replicas: HashMap<ReplicaId, ReplicaData>,
    /// offset -> remaining failures
    write_failures: HashMap<u64, usize>,
}

/// In-process storage engine. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<StorageState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` writes derived from source `offset`.
    pub async fn fail_writes_at(&self, offset: u64, times: usize) {
        self.state.write().await.write_failures.insert(offset, times);
    }

    pub async fn len(&self, replica: &ReplicaId) -> usize {
        self.state
            .read()
            .await
            .replicas
            .get(replica)
            .map(|data| data.values.values().filter(|v| v.value.is_some()).count())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, replica: &ReplicaId) -> bool {
        self.len(replica).await == 0
    }

    async fn write(&self, replica: &ReplicaId, key: Bytes, value: Option<Bytes>, offset: u64) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(remaining) = state.write_failures.get_mut(&offset) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestionError::Storage(format!(
                    "injected write failure at offset {}",
                    offset
                )));
            }
        }

        let data = state.replicas.entry(replica.clone()).or_default();
        match data.values.get(&key) {
            Some(existing) if existing.offset > offset => {}
            _ => {
                data.values.insert(key, StoredValue { value, offset });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn get(&self, replica: &ReplicaId, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self
            .state
            .read()
            .await
            .replicas
            .get(replica)
            .and_then(|data| data.values.get(key))
            .and_then(|stored| stored.value.clone()))
    }

    async fn put(&self, replica: &ReplicaId, key: Bytes, value: Bytes, offset: u64) -> Result<()> {
        self.write(replica, key, Some(value), offset).await
    }

    async fn delete(&self, replica: &ReplicaId, key: Bytes, offset: u64) -> Result<()> {
        self.write(replica, key, None, offset).await
    }

    async fn checkpoint(&self, replica: &ReplicaId) -> Result<Option<Checkpoint>> {
        Ok(self
            .state
            .read()
            .await
            .replicas
            .get(replica)
            .and_then(|data| data.checkpoint.clone()))
    }

    async fn commit_checkpoint(&self, replica: &ReplicaId, checkpoint: Checkpoint) -> Result<()> {
        self.state
            .write()
            .await
            .replicas
            .entry(replica.clone())
            .or_default()
            .checkpoint = Some(checkpoint);
        Ok(())
    }
}
