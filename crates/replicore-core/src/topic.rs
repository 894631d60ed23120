//! Replica and Topic Naming
//!
//! A partition replica is identified by `(store, version, partition)`. Each store
//! version has a **version topic** (`{store}_v{version}`), which carries the batch
//! push and everything the leader re-publishes, and each store has a
//! **real-time topic** (`{store}_rt`) fed by nearline writers. In active-active
//! mode there is one real-time topic per region; the region travels alongside the
//! topic name in [`TopicPartition`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a remote region (active-active replication).
pub type RegionId = u32;

/// Replication role of a partition replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Consumes the upstream source and re-publishes into the version topic
    Leader,
    /// Consumes the leader-produced version topic
    #[default]
    Standby,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Standby => write!(f, "STANDBY"),
        }
    }
}

const VERSION_SEPARATOR: &str = "_v";
const REAL_TIME_SUFFIX: &str = "_rt";

/// One assigned copy of one partition of one store version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId {
    pub store: String,
    pub version: u32,
    pub partition: u32,
}

impl ReplicaId {
    pub fn new(store: impl Into<String>, version: u32, partition: u32) -> Self {
        Self {
            store: store.into(),
            version,
            partition,
        }
    }

    /// The leader-produced stream for this replica's partition.
    pub fn version_topic(&self) -> TopicPartition {
        TopicPartition::new(version_topic(&self.store, self.version), self.partition)
    }

    /// The upstream nearline source, optionally in a specific region.
    pub fn real_time_topic(&self, region: Option<RegionId>) -> TopicPartition {
        let tp = TopicPartition::new(real_time_topic(&self.store), self.partition);
        match region {
            Some(region) => tp.in_region(region),
            None => tp,
        }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            version_topic(&self.store, self.version),
            self.partition
        )
    }
}

/// A partition of a named topic, optionally pinned to a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
    pub region: Option<RegionId>,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            region: None,
        }
    }

    pub fn in_region(mut self, region: RegionId) -> Self {
        self.region = Some(region);
        self
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region {
            Some(region) => write!(f, "{}-{}@r{}", self.topic, self.partition, region),
            None => write!(f, "{}-{}", self.topic, self.partition),
        }
    }
}

/// What a topic name refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Version { store: String, version: u32 },
    RealTime { store: String },
}

pub fn version_topic(store: &str, version: u32) -> String {
    format!("{}{}{}", store, VERSION_SEPARATOR, version)
}

pub fn real_time_topic(store: &str) -> String {
    format!("{}{}", store, REAL_TIME_SUFFIX)
}

/// Parse a topic name back into its store (and version).
pub fn parse_topic(name: &str) -> Result<TopicKind> {
    if let Some(store) = name.strip_suffix(REAL_TIME_SUFFIX) {
        if !store.is_empty() {
            return Ok(TopicKind::RealTime {
                store: store.to_string(),
            });
        }
    }

    if let Some(idx) = name.rfind(VERSION_SEPARATOR) {
        let (store, rest) = name.split_at(idx);
        let digits = &rest[VERSION_SEPARATOR.len()..];
        if !store.is_empty() && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        {
            if let Ok(version) = digits.parse::<u32>() {
                return Ok(TopicKind::Version {
                    store: store.to_string(),
                    version,
                });
            }
        }
    }

    Err(Error::InvalidTopic(name.to_string()))
}
