//! Offset Lag Tracker
//!
//! Turns consumed and latest-available positions into lag values for one
//! partition replica.
//!
//! ## Positions
//!
//! Both sides are expressed as *next offsets*: the consumed position is the
//! offset of the next record the replica will read, the latest position is the
//! partition's end offset. Their difference is the number of records not yet
//! consumed:
//!
//! ```text
//! lag            = max(0, latest - consumed)
//! over_threshold = max(0, lag - offset_lag_threshold)
//! ```
//!
//! Sampling `latest` and consuming race each other, so `consumed` may briefly
//! run ahead of the last sampled `latest`. Lags are clamped to zero.
//!
//! ## Lag Families
//!
//! | family               | phase       | leader measures          | follower measures   |
//! |----------------------|-------------|--------------------------|---------------------|
//! | batch                | before EOP  | version topic            | version topic       |
//! | hybrid (steady-state)| after EOP   | real-time topic(s)       | version topic       |
//!
//! The real-time lag used for readiness is measured against the upstream topic
//! for both roles; followers learn the upstream position from the metadata the
//! leader stamps on re-published records.

use crate::topic::{RegionId, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Records not yet consumed; never negative.
pub fn offset_lag(latest: u64, consumed: u64) -> u64 {
    latest.saturating_sub(consumed)
}

/// Portion of `lag` above the configured threshold; never negative.
pub fn over_threshold(lag: u64, threshold: u64) -> u64 {
    lag.saturating_sub(threshold)
}

/// Point-in-time lag view of one partition replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagSnapshot {
    pub role: Role,
    pub hybrid: bool,
    pub end_of_push_received: bool,
    pub start_of_buffer_replay_received: bool,
    pub leader_batch_lag: u64,
    pub leader_hybrid_lag: u64,
    pub follower_batch_lag: u64,
    pub follower_hybrid_lag: u64,
    /// Lag against the upstream real-time topic(s); `None` for batch-only versions
    /// or before the upstream end offset has been sampled.
    pub real_time_lag: Option<u64>,
    pub offset_lag_threshold: u64,
    pub region_lags: BTreeMap<RegionId, u64>,
}

impl LagSnapshot {
    pub fn leader_lag(&self) -> u64 {
        self.leader_batch_lag + self.leader_hybrid_lag
    }

    pub fn follower_lag(&self) -> u64 {
        self.follower_batch_lag + self.follower_hybrid_lag
    }

    pub fn batch_replication_lag(&self) -> u64 {
        self.leader_batch_lag + self.follower_batch_lag
    }

    pub fn real_time_lag_over_threshold(&self) -> u64 {
        self.real_time_lag
            .map(|lag| over_threshold(lag, self.offset_lag_threshold))
            .unwrap_or(0)
    }
}

/// Per-replica lag bookkeeping.
#[derive(Debug, Clone)]
pub struct OffsetLagTracker {
    role: Role,
    offset_lag_threshold: Option<u64>,
    end_of_push_received: bool,
    start_of_buffer_replay_received: bool,
    version_topic_consumed: u64,
    version_topic_latest: u64,
    upstream_consumed: BTreeMap<Option<RegionId>, u64>,
    upstream_latest: BTreeMap<Option<RegionId>, u64>,
}

impl OffsetLagTracker {
    /// `offset_lag_threshold` is `Some` for hybrid versions.
    pub fn new(role: Role, offset_lag_threshold: Option<u64>) -> Self {
        Self {
            role,
            offset_lag_threshold,
            end_of_push_received: false,
            start_of_buffer_replay_received: false,
            version_topic_consumed: 0,
            version_topic_latest: 0,
            upstream_consumed: BTreeMap::new(),
            upstream_latest: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub fn is_hybrid(&self) -> bool {
        self.offset_lag_threshold.is_some()
    }

    pub fn end_of_push_received(&self) -> bool {
        self.end_of_push_received
    }

    pub fn mark_end_of_push(&mut self) {
        self.end_of_push_received = true;
    }

    pub fn mark_start_of_buffer_replay(&mut self) {
        self.start_of_buffer_replay_received = true;
    }

    /// Next offset the replica will read from the version topic.
    pub fn record_version_topic_position(&mut self, next_offset: u64) {
        self.version_topic_consumed = next_offset;
    }

    pub fn record_version_topic_latest(&mut self, end_offset: u64) {
        self.version_topic_latest = end_offset;
    }

    /// Next upstream offset, either consumed directly (leader) or learned from
    /// leader metadata (follower). Positions only move forward.
    pub fn record_upstream_position(&mut self, region: Option<RegionId>, next_offset: u64) {
        let slot = self.upstream_consumed.entry(region).or_insert(0);
        *slot = (*slot).max(next_offset);
    }

    pub fn record_upstream_latest(&mut self, region: Option<RegionId>, end_offset: u64) {
        self.upstream_latest.insert(region, end_offset);
    }

    pub fn upstream_position(&self, region: Option<RegionId>) -> Option<u64> {
        self.upstream_consumed.get(&region).copied()
    }

    pub fn version_topic_position(&self) -> u64 {
        self.version_topic_consumed
    }

    pub fn version_topic_lag(&self) -> u64 {
        offset_lag(self.version_topic_latest, self.version_topic_consumed)
    }

    /// Lag of a single upstream region.
    pub fn region_lag(&self, region: Option<RegionId>) -> u64 {
        let latest = self.upstream_latest.get(&region).copied().unwrap_or(0);
        let consumed = self.upstream_consumed.get(&region).copied().unwrap_or(0);
        offset_lag(latest, consumed)
    }

    /// Summed lag against every sampled upstream topic.
    pub fn real_time_lag(&self) -> Option<u64> {
        if !self.is_hybrid() || self.upstream_latest.is_empty() {
            return None;
        }
        Some(
            self.upstream_latest
                .keys()
                .map(|region| self.region_lag(*region))
                .sum(),
        )
    }

    pub fn over_threshold_lag(&self) -> Option<u64> {
        let threshold = self.offset_lag_threshold?;
        self.real_time_lag().map(|lag| over_threshold(lag, threshold))
    }

    /// Whether the replica may serve reads.
    ///
    /// Batch-only versions are caught up once the end of push is consumed. Hybrid
    /// versions additionally need real-time lag at or below the threshold.
    pub fn is_caught_up(&self) -> bool {
        if !self.end_of_push_received {
            return false;
        }
        match self.offset_lag_threshold {
            None => true,
            Some(threshold) => self
                .real_time_lag()
                .map(|lag| lag <= threshold)
                .unwrap_or(false),
        }
    }

    pub fn snapshot(&self) -> LagSnapshot {
        let mut snapshot = LagSnapshot {
            role: self.role,
            hybrid: self.is_hybrid(),
            end_of_push_received: self.end_of_push_received,
            start_of_buffer_replay_received: self.start_of_buffer_replay_received,
            real_time_lag: self.real_time_lag(),
            offset_lag_threshold: self.offset_lag_threshold.unwrap_or(0),
            ..Default::default()
        };

        if !self.end_of_push_received {
            let lag = self.version_topic_lag();
            match self.role {
                Role::Leader => snapshot.leader_batch_lag = lag,
                Role::Standby => snapshot.follower_batch_lag = lag,
            }
        } else if self.is_hybrid() {
            match self.role {
                Role::Leader => snapshot.leader_hybrid_lag = snapshot.real_time_lag.unwrap_or(0),
                Role::Standby => snapshot.follower_hybrid_lag = self.version_topic_lag(),
            }
        }

        for region in self.upstream_latest.keys().filter_map(|r| *r) {
            snapshot
                .region_lags
                .insert(region, self.region_lag(Some(region)));
        }

        snapshot
    }
}
