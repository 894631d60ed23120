//! Partition Consumption State Machine
//!
//! One [`PartitionConsumer`] task drives one partition replica from
//! subscription to unsubscription.
//!
//! ## States
//!
//! ```text
//! NOT_SUBSCRIBED -> SUBSCRIBING -> BOOTSTRAPPING -> ONLINE
//!                                        |            |
//!                                        +-> ERROR <--+      (after end of push only)
//!                          any state ---------> UNSUBSCRIBED
//! ```
//!
//! `SUBSCRIBING` is timed in three phases, each recorded on its own latency
//! sensor: preparation (checkpoint read), consumer acquisition and the
//! subscribe call.
//!
//! ## Consumption Cycle
//!
//! 1. Reconcile subscriptions with the role (version topic, or real-time
//!    topics for a caught-up hybrid leader)
//! 2. Poll a batch
//! 3. Process each record: merge partial updates, write through storage,
//!    re-publish real-time records into the version topic (leader)
//! 4. Commit the checkpoint
//! 5. **Safe point**: apply queued role changes and stop requests
//! 6. Sample end offsets, update lag, report stats, evaluate readiness
//!
//! ## Failure Handling
//!
//! - Source unavailability is retried with capped exponential backoff. After
//!   `stale_grace` of uninterrupted failures the replica flags itself stale.
//! - A processing error before end of push is retried until it succeeds; the
//!   error flag is never raised for it.
//! - A processing error after end of push raises the sticky error flag, moves
//!   the replica to `ERROR` and stops consumption until the replica is stopped.
//! - No end of push within `bootstrap_timeout` raises the push-timeout flag;
//!   consumption continues.

use crate::cache::HandleCache;
use crate::config::{IngestionConfig, StoreVersionConfig};
use crate::error::{IngestionError, Result};
use crate::source::{current_timestamp_ms, IngestionSource, SourceConsumer};
use crate::storage::{Checkpoint, StorageEngine};
use bytes::Bytes;
use replicore_core::write_compute::{decode_value, encode_value};
use replicore_core::{
    apply_update, ChangeRecord, ControlMessage, LagSnapshot, OffsetLagTracker, Payload, RegionId,
    ReplicaId, Role, TopicPartition, UpstreamPosition, ValueSchema, WriteComputeRecord,
};
use replicore_observability::metrics::{
    INGESTION_ERRORS_TOTAL, MERGES_TOTAL, MERGE_LATENCY, POLL_BATCH_SIZE, REPLICA_STATES,
    ROLE_TRANSITIONS_TOTAL, SOURCE_RETRIES_TOTAL, STATE_TRANSITIONS_TOTAL,
};
use replicore_observability::{IngestionStatsAggregator, PartitionReport};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a partition replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    NotSubscribed,
    Subscribing,
    Bootstrapping,
    Online,
    Error,
    Unsubscribed,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::NotSubscribed => "NOT_SUBSCRIBED",
            ReplicaState::Subscribing => "SUBSCRIBING",
            ReplicaState::Bootstrapping => "BOOTSTRAPPING",
            ReplicaState::Online => "ONLINE",
            ReplicaState::Error => "ERROR",
            ReplicaState::Unsubscribed => "UNSUBSCRIBED",
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outward view of a replica, published after every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub state: ReplicaState,
    pub role: Role,
    /// Caught up and serving reads
    pub ready: bool,
    /// Sticky: processing failed after end of push
    pub errored: bool,
    /// Sticky: no end of push within the push SLA
    pub push_timeout: bool,
    /// Source failures persisted longer than the grace period
    pub stale: bool,
    pub lag: LagSnapshot,
}

impl ReplicaStatus {
    pub fn new(role: Role) -> Self {
        Self {
            state: ReplicaState::NotSubscribed,
            role,
            ready: false,
            errored: false,
            push_timeout: false,
            stale: false,
            lag: LagSnapshot {
                role,
                ..Default::default()
            },
        }
    }
}

/// Control messages delivered to a running replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaCommand {
    ChangeRole(Role),
    Stop,
}

/// Collaborators shared by every replica of a host.
#[derive(Clone)]
pub(crate) struct ReplicaContext {
    pub config: Arc<IngestionConfig>,
    pub source: Arc<dyn IngestionSource>,
    pub storage: Arc<dyn StorageEngine>,
    pub stats: Arc<IngestionStatsAggregator>,
    pub producers: HandleCache,
}

/// Why a cycle ended early.
enum Interrupt {
    Stopped,
    Failed(IngestionError),
}

type Flow = std::result::Result<(), Interrupt>;

/// Capped exponential retry delay.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn merge_value(
    schema: &ValueSchema,
    current: Option<&[u8]>,
    update: &WriteComputeRecord,
) -> replicore_core::Result<Bytes> {
    let current = current.map(decode_value).transpose()?;
    let merged = apply_update(schema, current.as_ref(), update)?;
    encode_value(&merged)
}

/// Consumption task of one partition replica.
pub struct PartitionConsumer {
    replica: ReplicaId,
    version_topic: TopicPartition,
    version_config: StoreVersionConfig,
    ctx: ReplicaContext,

    commands: mpsc::Receiver<ReplicaCommand>,
    status: watch::Sender<ReplicaStatus>,

    state: ReplicaState,
    role: Role,
    tracker: OffsetLagTracker,

    consumer: Option<Box<dyn SourceConsumer>>,
    subscriptions: BTreeSet<TopicPartition>,
    /// Leader has caught up on the version topic and reads real-time topics
    consumes_real_time: bool,
    /// Version-topic end offset a newly promoted leader must reach first
    catch_up_target: Option<u64>,

    pending_role: Option<Role>,
    stop_requested: bool,

    errored: bool,
    push_timeout: bool,
    stale: bool,
    write_compute_error_code: i64,
    failing_since: Option<Instant>,
    backoff: Backoff,
    started_at: Instant,
}

impl PartitionConsumer {
    pub(crate) fn new(
        replica: ReplicaId,
        version_config: StoreVersionConfig,
        role: Role,
        ctx: ReplicaContext,
        commands: mpsc::Receiver<ReplicaCommand>,
        status: watch::Sender<ReplicaStatus>,
    ) -> Self {
        let tracker = OffsetLagTracker::new(role, version_config.offset_lag_threshold());
        let backoff = Backoff::new(ctx.config.initial_backoff, ctx.config.max_backoff);
        REPLICA_STATES
            .with_label_values(&[ReplicaState::NotSubscribed.as_str()])
            .inc();

        Self {
            version_topic: replica.version_topic(),
            replica,
            version_config,
            ctx,
            commands,
            status,
            state: ReplicaState::NotSubscribed,
            role,
            tracker,
            consumer: None,
            subscriptions: BTreeSet::new(),
            consumes_real_time: false,
            catch_up_target: None,
            pending_role: None,
            stop_requested: false,
            errored: false,
            push_timeout: false,
            stale: false,
            write_compute_error_code: 0,
            failing_since: None,
            backoff,
            started_at: Instant::now(),
        }
    }

    /// Drive the replica until it is stopped.
    pub async fn run(mut self) {
        info!(
            replica = %self.replica,
            role = %self.role,
            hybrid = self.version_config.is_hybrid(),
            active_active = self.version_config.active_active,
            "Starting partition consumption"
        );

        self.set_state(ReplicaState::Subscribing);
        match self.subscribe().await {
            Ok(()) => {
                self.set_state(ReplicaState::Bootstrapping);
                self.publish_status();
                self.consume().await;
            }
            Err(Interrupt::Stopped) => {}
            Err(Interrupt::Failed(err)) => {
                self.fail(err);
                self.park().await;
            }
        }

        self.shutdown().await;
    }

    async fn consume(&mut self) {
        loop {
            if self.stop_requested {
                return;
            }
            match self.cycle().await {
                Ok(()) => {}
                Err(Interrupt::Stopped) => return,
                Err(Interrupt::Failed(err)) => {
                    self.fail(err);
                    self.park().await;
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------

    async fn subscribe(&mut self) -> Flow {
        let (store, version) = (self.replica.store.clone(), self.replica.version);

        let started = Instant::now();
        let checkpoint = loop {
            match self.ctx.storage.checkpoint(&self.replica).await {
                Ok(checkpoint) => break checkpoint,
                Err(err) => self.retry_source("checkpoint", err).await?,
            }
        };
        if let Some(checkpoint) = checkpoint {
            self.restore(checkpoint);
        }
        self.ctx
            .stats
            .record_subscribe_prep_latency(&store, version, elapsed_ms(started));

        let started = Instant::now();
        let consumer = loop {
            match self.ctx.source.acquire_consumer(&self.replica).await {
                Ok(consumer) => break consumer,
                Err(err) => self.retry_source("acquire_consumer", err).await?,
            }
        };
        self.consumer = Some(consumer);
        self.ctx
            .stats
            .record_subscribe_get_consumer_latency(&store, version, elapsed_ms(started));

        loop {
            match self.sync_subscriptions().await {
                Ok(()) => break,
                Err(err) => self.retry_source("subscribe", err).await?,
            }
        }
        self.source_recovered();
        Ok(())
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        debug!(
            replica = %self.replica,
            offset = checkpoint.version_topic_offset,
            end_of_push = checkpoint.end_of_push_received,
            "Restoring from checkpoint"
        );
        self.tracker
            .record_version_topic_position(checkpoint.version_topic_offset);
        if checkpoint.end_of_push_received {
            self.tracker.mark_end_of_push();
        }
        if checkpoint.start_of_buffer_replay_received {
            self.tracker.mark_start_of_buffer_replay();
        }
        for position in checkpoint.upstream {
            self.tracker
                .record_upstream_position(position.region, position.offset);
        }
    }

    fn desired_subscriptions(&self) -> BTreeSet<TopicPartition> {
        if self.role == Role::Leader && self.consumes_real_time {
            self.version_config
                .upstream_regions()
                .into_iter()
                .map(|region| self.replica.real_time_topic(region))
                .collect()
        } else {
            BTreeSet::from([self.version_topic.clone()])
        }
    }

    async fn sync_subscriptions(&mut self) -> Result<()> {
        let Some(mut consumer) = self.consumer.take() else {
            return Err(IngestionError::SourceUnavailable(
                "no consumer acquired".to_string(),
            ));
        };
        let result = self.sync_with(consumer.as_mut()).await;
        self.consumer = Some(consumer);
        result
    }

    async fn sync_with(&mut self, consumer: &mut dyn SourceConsumer) -> Result<()> {
        let desired = self.desired_subscriptions();
        if desired == self.subscriptions {
            return Ok(());
        }

        let stale: Vec<_> = self.subscriptions.difference(&desired).cloned().collect();
        for tp in stale {
            consumer.unsubscribe(&tp).await?;
            self.subscriptions.remove(&tp);
            info!(replica = %self.replica, topic = %tp, "Unsubscribed");
        }

        let missing: Vec<_> = desired.difference(&self.subscriptions).cloned().collect();
        for tp in missing {
            let offset = self.start_offset(&tp).await?;
            let started = Instant::now();
            consumer.subscribe(&tp, offset).await?;
            self.ctx.stats.record_subscribe_consumer_subscribe_latency(
                &self.replica.store,
                self.replica.version,
                elapsed_ms(started),
            );
            if tp != self.version_topic {
                self.tracker.record_upstream_position(tp.region, offset);
            }
            info!(replica = %self.replica, topic = %tp, offset, "Subscribed");
            self.subscriptions.insert(tp);
        }
        Ok(())
    }

    async fn start_offset(&mut self, tp: &TopicPartition) -> Result<u64> {
        if *tp == self.version_topic {
            return Ok(self.tracker.version_topic_position());
        }
        if let Some(next) = self.tracker.upstream_position(tp.region) {
            return Ok(next);
        }
        let rewind_ms = self
            .version_config
            .hybrid
            .map(|h| h.rewind_seconds * 1000)
            .unwrap_or(0);
        let timestamp = current_timestamp_ms().saturating_sub(rewind_ms);
        self.ctx.source.offset_for_timestamp(tp, timestamp).await
    }

    // ------------------------------------------------------------------
    // Consumption cycle
    // ------------------------------------------------------------------

    async fn cycle(&mut self) -> Flow {
        if let Err(err) = self.sync_subscriptions().await {
            return self.retry_source("subscribe", err).await;
        }

        let max_records = self.ctx.config.poll_batch_size;
        let polled = match self.consumer.as_mut() {
            Some(consumer) => consumer.poll(max_records).await,
            None => Err(IngestionError::SourceUnavailable(
                "no consumer acquired".to_string(),
            )),
        };
        let batch = match polled {
            Ok(batch) => batch,
            Err(err) => return self.retry_source("poll", err).await,
        };
        self.source_recovered();

        POLL_BATCH_SIZE
            .with_label_values(&[self.role.to_string().as_str()])
            .observe(batch.len() as f64);

        let mut processed = 0usize;
        for (tp, record) in batch {
            if !self.subscriptions.contains(&tp) {
                continue;
            }
            if tp == self.version_topic && record.offset < self.tracker.version_topic_position() {
                continue;
            }
            self.process_with_retry(&tp, record).await?;
            processed += 1;
        }

        if processed > 0 {
            self.commit_with_retry().await?;
        }

        // Safe point: the batch is durable.
        self.drain_commands();
        if self.stop_requested {
            return Err(Interrupt::Stopped);
        }
        if let Some(role) = self.pending_role.take() {
            self.apply_role(role);
        }
        self.advance_leader_phase().await;

        self.sample_lag().await;
        self.evaluate_readiness();
        self.report();

        if processed == 0 {
            self.pause(self.ctx.config.poll_interval).await;
        }
        Ok(())
    }

    async fn process_with_retry(&mut self, tp: &TopicPartition, record: ChangeRecord) -> Flow {
        let mut backoff = Backoff::new(self.ctx.config.initial_backoff, self.ctx.config.max_backoff);
        loop {
            match self.process(tp, &record).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(replica = %self.replica, topic = %tp, offset = record.offset, "Record failed");
                    self.handle_processing_error(err, &mut backoff).await?;
                }
            }
        }
    }

    async fn commit_with_retry(&mut self) -> Flow {
        let mut backoff = Backoff::new(self.ctx.config.initial_backoff, self.ctx.config.max_backoff);
        loop {
            match self.commit().await {
                Ok(()) => return Ok(()),
                Err(err) => self.handle_processing_error(err, &mut backoff).await?,
            }
        }
    }

    /// Retry before end of push, give up after it. Source unavailability is
    /// always retried.
    async fn handle_processing_error(&mut self, err: IngestionError, backoff: &mut Backoff) -> Flow {
        if err.is_retriable() {
            return self.retry_source("process", err).await;
        }

        let end_of_push = self.tracker.end_of_push_received();
        let phase = if end_of_push {
            "after_end_of_push"
        } else {
            "before_end_of_push"
        };
        INGESTION_ERRORS_TOTAL
            .with_label_values(&[err.kind(), phase])
            .inc();
        if err.write_compute_code() != 0 {
            self.write_compute_error_code = err.write_compute_code();
        }

        if end_of_push {
            return Err(Interrupt::Failed(err));
        }

        warn!(
            replica = %self.replica,
            error = %err,
            "Ingestion error before end of push, retrying"
        );
        self.check_push_timeout();
        self.pause(backoff.next_delay()).await;
        if self.stop_requested {
            return Err(Interrupt::Stopped);
        }
        Ok(())
    }

    async fn process(&mut self, tp: &TopicPartition, record: &ChangeRecord) -> Result<()> {
        if tp.topic == self.version_topic.topic {
            self.process_version_topic(record).await
        } else {
            self.process_real_time(tp, record).await
        }
    }

    async fn process_version_topic(&mut self, record: &ChangeRecord) -> Result<()> {
        match &record.payload {
            Payload::Control(message) => self.apply_control(*message, record.offset),
            Payload::Put(value) => {
                self.ctx
                    .storage
                    .put(&self.replica, record.key.clone(), value.clone(), record.offset)
                    .await?
            }
            Payload::Delete => {
                self.ctx
                    .storage
                    .delete(&self.replica, record.key.clone(), record.offset)
                    .await?
            }
            Payload::Update(update) => {
                let merged = self.merge(&record.key, update).await?;
                self.ctx
                    .storage
                    .put(&self.replica, record.key.clone(), merged, record.offset)
                    .await?
            }
        }

        if let Some(upstream) = record.upstream {
            self.tracker
                .record_upstream_position(upstream.region, upstream.offset + 1);
        }
        self.tracker.record_version_topic_position(record.offset + 1);
        self.record_consumed(record, None);
        Ok(())
    }

    /// Leader path: merge, re-publish into the version topic stamped with the
    /// upstream position, then persist under the produced offset.
    async fn process_real_time(&mut self, tp: &TopicPartition, record: &ChangeRecord) -> Result<()> {
        let value = match &record.payload {
            Payload::Control(_) => {
                self.tracker
                    .record_upstream_position(tp.region, record.offset + 1);
                return Ok(());
            }
            Payload::Put(value) => Some(value.clone()),
            Payload::Delete => None,
            Payload::Update(update) => Some(self.merge(&record.key, update).await?),
        };

        let payload = match &value {
            Some(value) => Payload::Put(value.clone()),
            None => Payload::Delete,
        };
        let republished = ChangeRecord::new(0, record.timestamp, record.key.clone(), payload)
            .with_upstream(UpstreamPosition {
                region: tp.region,
                offset: record.offset,
            });
        let produced_bytes = republished.estimated_size() as u64;

        let producer = self.ctx.producers.producer(&self.version_topic.topic).await?;
        let produced = producer
            .produce(self.replica.partition, republished)
            .await?;

        match value {
            Some(value) => {
                self.ctx
                    .storage
                    .put(&self.replica, record.key.clone(), value, produced)
                    .await?
            }
            None => {
                self.ctx
                    .storage
                    .delete(&self.replica, record.key.clone(), produced)
                    .await?
            }
        }

        self.tracker
            .record_upstream_position(tp.region, record.offset + 1);
        self.tracker.record_version_topic_position(produced + 1);

        let (store, version) = (&self.replica.store, self.replica.version);
        self.ctx.stats.record_leader_records_produced(store, version, 1);
        self.ctx
            .stats
            .record_leader_bytes_produced(store, version, produced_bytes);
        self.record_consumed(record, tp.region);
        Ok(())
    }

    fn apply_control(&mut self, message: ControlMessage, offset: u64) {
        match message {
            ControlMessage::StartOfPush => {
                info!(replica = %self.replica, offset, "Start of push");
            }
            ControlMessage::EndOfPush => {
                info!(replica = %self.replica, offset, "End of push received");
                self.tracker.mark_end_of_push();
            }
            ControlMessage::StartOfBufferReplay => {
                info!(replica = %self.replica, offset, "Start of buffer replay received");
                self.tracker.mark_start_of_buffer_replay();
            }
        }
    }

    async fn merge(&mut self, key: &Bytes, update: &WriteComputeRecord) -> Result<Bytes> {
        let started = Instant::now();
        let current = self.ctx.storage.get(&self.replica, key).await?;
        let merged = merge_value(&self.version_config.value_schema, current.as_deref(), update);

        MERGE_LATENCY
            .with_label_values(&[self.replica.store.as_str()])
            .observe(started.elapsed().as_secs_f64());
        match merged {
            Ok(value) => {
                MERGES_TOTAL.with_label_values(&["success"]).inc();
                self.write_compute_error_code = 0;
                Ok(value)
            }
            Err(err) => {
                MERGES_TOTAL.with_label_values(&["failure"]).inc();
                Err(err.into())
            }
        }
    }

    fn record_consumed(&self, record: &ChangeRecord, region: Option<RegionId>) {
        let stats = &self.ctx.stats;
        let (store, version) = (&self.replica.store, self.replica.version);
        let bytes = record.estimated_size() as u64;

        stats.record_records_consumed(store, version, 1);
        stats.record_bytes_consumed(store, version, bytes);
        match self.role {
            Role::Leader => {
                stats.record_leader_records_consumed(store, version, 1);
                stats.record_leader_bytes_consumed(store, version, bytes);
            }
            Role::Standby => {
                stats.record_follower_records_consumed(store, version, 1);
                stats.record_follower_bytes_consumed(store, version, bytes);
            }
        }
        if let Some(region) = region {
            stats.record_region_records_consumed(store, version, region, 1);
            stats.record_region_bytes_consumed(store, version, region, bytes);
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let snapshot = self.tracker.snapshot();
        let upstream = self
            .version_config
            .upstream_regions()
            .into_iter()
            .filter_map(|region| {
                self.tracker
                    .upstream_position(region)
                    .map(|offset| UpstreamPosition { region, offset })
            })
            .collect();

        let checkpoint = Checkpoint {
            version_topic_offset: self.tracker.version_topic_position(),
            end_of_push_received: snapshot.end_of_push_received,
            start_of_buffer_replay_received: snapshot.start_of_buffer_replay_received,
            upstream,
        };
        self.ctx
            .storage
            .commit_checkpoint(&self.replica, checkpoint)
            .await
    }

    // ------------------------------------------------------------------
    // Safe point
    // ------------------------------------------------------------------

    fn queue_command(&mut self, command: ReplicaCommand) {
        match command {
            ReplicaCommand::ChangeRole(role) => self.pending_role = Some(role),
            ReplicaCommand::Stop => self.stop_requested = true,
        }
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.queue_command(command),
                Err(mpsc::error::TryRecvError::Empty) => return,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.stop_requested = true;
                    return;
                }
            }
        }
    }

    /// Sleep, waking early when a command arrives.
    async fn pause(&mut self, duration: Duration) {
        let received = tokio::select! {
            _ = tokio::time::sleep(duration) => None,
            command = self.commands.recv() => Some(command),
        };
        match received {
            Some(Some(command)) => self.queue_command(command),
            Some(None) => self.stop_requested = true,
            None => {}
        }
    }

    fn apply_role(&mut self, role: Role) {
        if role == self.role {
            debug!(replica = %self.replica, role = %role, "Role unchanged");
            return;
        }
        info!(
            replica = %self.replica,
            from = %self.role,
            to = %role,
            "Applying role transition"
        );
        ROLE_TRANSITIONS_TOTAL
            .with_label_values(&[role.to_string().as_str()])
            .inc();

        self.role = role;
        self.tracker.set_role(role);
        self.consumes_real_time = false;
        self.catch_up_target = None;
        self.publish_status();
    }

    /// A hybrid leader past end of push reads the version topic up to the end
    /// offset seen at promotion, then switches to the real-time topics.
    async fn advance_leader_phase(&mut self) {
        if self.role != Role::Leader
            || !self.version_config.is_hybrid()
            || !self.tracker.end_of_push_received()
            || self.consumes_real_time
        {
            return;
        }

        let target = match self.catch_up_target {
            Some(target) => target,
            None => match self.ctx.source.end_offset(&self.version_topic).await {
                Ok(target) => {
                    self.catch_up_target = Some(target);
                    target
                }
                Err(err) => {
                    self.on_source_failure("end_offset", &err);
                    return;
                }
            },
        };

        if self.tracker.version_topic_position() >= target {
            info!(
                replica = %self.replica,
                offset = target,
                "Leader caught up on version topic, switching to real-time"
            );
            self.consumes_real_time = true;
            self.catch_up_target = None;
        }
    }

    // ------------------------------------------------------------------
    // Lag, readiness and reporting
    // ------------------------------------------------------------------

    async fn sample_lag(&mut self) {
        match self.ctx.source.end_offset(&self.version_topic).await {
            Ok(end) => self.tracker.record_version_topic_latest(end),
            Err(err) => {
                self.on_source_failure("end_offset", &err);
                return;
            }
        }

        if !self.version_config.is_hybrid() || !self.tracker.end_of_push_received() {
            return;
        }
        for region in self.version_config.upstream_regions() {
            let tp = self.replica.real_time_topic(region);
            match self.ctx.source.end_offset(&tp).await {
                Ok(end) => self.tracker.record_upstream_latest(region, end),
                Err(err) => {
                    self.on_source_failure("end_offset", &err);
                    return;
                }
            }
        }
    }

    fn evaluate_readiness(&mut self) {
        if self.state == ReplicaState::Bootstrapping && self.tracker.is_caught_up() {
            info!(
                replica = %self.replica,
                real_time_lag = ?self.tracker.real_time_lag(),
                "Replica caught up, now online"
            );
            self.set_state(ReplicaState::Online);
        }

        self.check_push_timeout();
    }

    /// Raise the push-timeout flag once the push SLA passes without an end of
    /// push. Runs on every retry as well, so a bootstrap stuck on a failing
    /// record or an unavailable source is still flagged.
    fn check_push_timeout(&mut self) {
        if self.push_timeout
            || self.tracker.end_of_push_received()
            || self.started_at.elapsed() <= self.ctx.config.bootstrap_timeout
        {
            return;
        }
        warn!(
            replica = %self.replica,
            timeout_ms = self.ctx.config.bootstrap_timeout.as_millis() as u64,
            "No end of push within the push timeout"
        );
        self.push_timeout = true;
        self.ctx
            .stats
            .set_push_timeout(&self.replica.store, self.replica.version);
        self.publish_status();
    }

    fn report(&self) {
        self.ctx.stats.report_partition(
            &self.replica.store,
            self.replica.version,
            self.replica.partition,
            PartitionReport {
                lag: self.tracker.snapshot(),
                write_compute_error_code: self.write_compute_error_code,
            },
        );
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status.send_replace(ReplicaStatus {
            state: self.state,
            role: self.role,
            ready: self.state == ReplicaState::Online,
            errored: self.errored,
            push_timeout: self.push_timeout,
            stale: self.stale,
            lag: self.tracker.snapshot(),
        });
    }

    fn set_state(&mut self, state: ReplicaState) {
        if state == self.state {
            return;
        }
        debug!(replica = %self.replica, from = %self.state, to = %state, "State transition");
        STATE_TRANSITIONS_TOTAL
            .with_label_values(&[self.state.as_str(), state.as_str()])
            .inc();
        REPLICA_STATES
            .with_label_values(&[self.state.as_str()])
            .dec();
        REPLICA_STATES.with_label_values(&[state.as_str()]).inc();
        self.state = state;
        self.publish_status();
    }

    // ------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------

    async fn retry_source(&mut self, operation: &'static str, err: IngestionError) -> Flow {
        if matches!(err, IngestionError::Configuration(_)) {
            return Err(Interrupt::Failed(err));
        }
        self.on_source_failure(operation, &err);
        self.check_push_timeout();
        let delay = self.backoff.next_delay();
        self.pause(delay).await;
        if self.stop_requested {
            return Err(Interrupt::Stopped);
        }
        Ok(())
    }

    fn on_source_failure(&mut self, operation: &'static str, err: &IngestionError) {
        SOURCE_RETRIES_TOTAL.with_label_values(&[operation]).inc();
        let since = *self.failing_since.get_or_insert_with(Instant::now);
        debug!(replica = %self.replica, operation, error = %err, "Source operation failed");

        if !self.stale && since.elapsed() >= self.ctx.config.stale_grace {
            warn!(
                replica = %self.replica,
                operation,
                error = %err,
                "Source unavailable past grace period, replica is stale"
            );
            self.stale = true;
            self.ctx
                .stats
                .record_stale_partition(&self.replica.store, self.replica.version);
            self.publish_status();
        }
    }

    fn source_recovered(&mut self) {
        self.failing_since = None;
        self.backoff.reset();
        if self.stale {
            info!(replica = %self.replica, "Source recovered");
            self.stale = false;
            self.publish_status();
        }
    }

    fn fail(&mut self, err: IngestionError) {
        error!(
            replica = %self.replica,
            error = %err,
            "Ingestion error after end of push, replica halted"
        );
        self.errored = true;
        self.ctx
            .stats
            .set_errored(&self.replica.store, self.replica.version);
        self.set_state(ReplicaState::Error);
        self.report();
    }

    /// Wait in `ERROR` until stopped.
    async fn park(&mut self) {
        while !self.stop_requested {
            match self.commands.recv().await {
                Some(ReplicaCommand::Stop) | None => return,
                Some(ReplicaCommand::ChangeRole(role)) => {
                    warn!(replica = %self.replica, role = %role, "Ignoring role change for errored replica");
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            for tp in std::mem::take(&mut self.subscriptions) {
                if let Err(err) = consumer.unsubscribe(&tp).await {
                    debug!(replica = %self.replica, topic = %tp, error = %err, "Unsubscribe failed");
                }
            }
        }
        self.ctx.stats.remove_partition(
            &self.replica.store,
            self.replica.version,
            self.replica.partition,
        );
        self.set_state(ReplicaState::Unsubscribed);
        REPLICA_STATES
            .with_label_values(&[ReplicaState::Unsubscribed.as_str()])
            .dec();
        info!(replica = %self.replica, "Partition consumption stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicore_core::FieldKind;
    use serde_json::json;

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_merge_value_starts_from_defaults() {
        let schema = ValueSchema::new()
            .with_field("name", FieldKind::Scalar, json!(""))
            .with_field("tags", FieldKind::List, json!([]));
        let update = WriteComputeRecord::new().list_add("tags", vec![json!("a")]);

        let merged = merge_value(&schema, None, &update).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&merged).unwrap();
        assert_eq!(value, json!({"name": "", "tags": ["a"]}));
    }

    #[test]
    fn test_merge_value_rejects_unknown_field() {
        let schema = ValueSchema::new().with_field("name", FieldKind::Scalar, json!(""));
        let update = WriteComputeRecord::new().set("age", json!(3));
        assert!(merge_value(&schema, Some(br#"{"name":"x"}"#), &update).is_err());
    }

    #[test]
    fn test_initial_status() {
        let status = ReplicaStatus::new(Role::Leader);
        assert_eq!(status.state, ReplicaState::NotSubscribed);
        assert_eq!(status.role, Role::Leader);
        assert!(!status.ready && !status.errored && !status.push_timeout && !status.stale);
        assert_eq!(ReplicaState::Bootstrapping.to_string(), "BOOTSTRAPPING");
    }

    #[test]
    fn test_run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        // Type-checked only: the replica task must be spawnable on the runtime.
        let _ = |consumer: PartitionConsumer| {
            let run = consumer.run();
            assert_send(&run);
        };
    }
}
