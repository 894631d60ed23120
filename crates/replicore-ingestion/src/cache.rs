//! Producer Handle Cache
//!
//! Leaders of every partition of a version re-publish into the same version
//! topic, so producer handles are shared per topic. Creation is memoized with
//! `moka`'s `try_get_with`: concurrent first callers for a topic wait on a
//! single in-flight creation instead of opening one handle each, and a failed
//! creation is not cached.

use crate::error::{IngestionError, Result};
use crate::source::{IngestionSource, LogProducer};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct HandleCache {
    source: Arc<dyn IngestionSource>,
    producers: Cache<String, Arc<dyn LogProducer>>,
}

impl HandleCache {
    pub fn new(source: Arc<dyn IngestionSource>, capacity: u64) -> Self {
        // Idle handles of retired versions age out
        let producers = Cache::builder()
            .max_capacity(capacity)
            .time_to_idle(Duration::from_secs(60 * 60))
            .build();

        Self { source, producers }
    }

    pub async fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>> {
        let source = Arc::clone(&self.source);
        let owned = topic.to_string();
        self.producers
            .try_get_with(owned.clone(), async move {
                debug!(topic = %owned, "Opening producer");
                source.producer(&owned).await
            })
            .await
            .map_err(|e| {
                IngestionError::SourceUnavailable(format!("producer for {}: {}", topic, e))
            })
    }

    pub async fn invalidate(&self, topic: &str) {
        self.producers.invalidate(topic).await;
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.producers.contains_key(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemoryLog, SourceConsumer};
    use async_trait::async_trait;
    use replicore_core::{ReplicaId, TopicPartition};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts producer creations and makes them slow enough to overlap.
    struct CountingSource {
        log: MemoryLog,
        created: AtomicUsize,
    }

    #[async_trait]
    impl IngestionSource for CountingSource {
        async fn acquire_consumer(&self, replica: &ReplicaId) -> Result<Box<dyn SourceConsumer>> {
            self.log.acquire_consumer(replica).await
        }

        async fn end_offset(&self, tp: &TopicPartition) -> Result<u64> {
            self.log.end_offset(tp).await
        }

        async fn offset_for_timestamp(&self, tp: &TopicPartition, ts: u64) -> Result<u64> {
            self.log.offset_for_timestamp(tp, ts).await
        }

        async fn producer(&self, topic: &str) -> Result<Arc<dyn LogProducer>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.log.producer(topic).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_callers_share_one_creation() {
        let source = Arc::new(CountingSource {
            log: MemoryLog::new(),
            created: AtomicUsize::new(0),
        });
        let cache = HandleCache::new(source.clone(), 16);

        let (a, b, c) = tokio::join!(
            cache.producer("orders_v1"),
            cache.producer("orders_v1"),
            cache.producer("orders_v1"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(source.created.load(Ordering::SeqCst), 1);

        cache.producer("orders_v2").await.unwrap();
        assert_eq!(source.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let log = MemoryLog::new();
        let cache = HandleCache::new(Arc::new(log.clone()), 16);

        log.set_available(false);
        assert!(cache.producer("orders_v1").await.is_err());
        assert!(!cache.contains("orders_v1"));

        log.set_available(true);
        assert!(cache.producer("orders_v1").await.is_ok());
        assert!(cache.contains("orders_v1"));
    }
}
