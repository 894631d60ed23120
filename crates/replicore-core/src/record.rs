//! Change Log Records
//!
//! This module defines `ChangeRecord`, the unit of data delivered by the
//! ingestion source for a single topic partition.
//!
//! ## Structure
//! Each record contains:
//! - **offset**: Monotonically increasing position within the topic partition
//! - **timestamp**: Producer timestamp (milliseconds since epoch)
//! - **key**: Store key the record applies to (empty for control messages)
//! - **payload**: A full value, a delete, a partial update or a control message
//! - **upstream**: Where the leader consumed the record from before re-publishing
//!   it into the version topic (`None` for batch data and real-time records)
//!
//! ## Control Messages
//! Control messages are markers in the stream rather than data:
//! - `StartOfPush` / `EndOfPush` bracket the batch load of a version
//! - `StartOfBufferReplay` marks the start of nearline replay for hybrid versions
//!
//! ## Example
//! ```ignore
//! let record = ChangeRecord::put(
//!     42,
//!     1700000000000,
//!     Bytes::from("user-1"),
//!     Bytes::from(r#"{"name":"ada"}"#),
//! );
//! ```

use crate::topic::RegionId;
use crate::write_compute::WriteComputeRecord;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Markers in the change log that carry no key/value data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    StartOfPush,
    EndOfPush,
    StartOfBufferReplay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Full value (JSON-encoded record)
    Put(Bytes),
    Delete,
    /// Partial update merged against the stored value
    Update(WriteComputeRecord),
    Control(ControlMessage),
}

/// Position of a record in the upstream real-time topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamPosition {
    pub region: Option<RegionId>,
    pub offset: u64,
}

/// A single record in a topic partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Offset of this record in the partition
    pub offset: u64,

    /// Timestamp in milliseconds since epoch
    pub timestamp: u64,

    pub key: Bytes,

    pub payload: Payload,

    /// Upstream position stamped by the leader when re-publishing
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upstream: Option<UpstreamPosition>,
}

impl ChangeRecord {
    pub fn new(offset: u64, timestamp: u64, key: Bytes, payload: Payload) -> Self {
        Self {
            offset,
            timestamp,
            key,
            payload,
            upstream: None,
        }
    }

    pub fn put(offset: u64, timestamp: u64, key: Bytes, value: Bytes) -> Self {
        Self::new(offset, timestamp, key, Payload::Put(value))
    }

    pub fn delete(offset: u64, timestamp: u64, key: Bytes) -> Self {
        Self::new(offset, timestamp, key, Payload::Delete)
    }

    pub fn update(offset: u64, timestamp: u64, key: Bytes, update: WriteComputeRecord) -> Self {
        Self::new(offset, timestamp, key, Payload::Update(update))
    }

    pub fn control(offset: u64, timestamp: u64, message: ControlMessage) -> Self {
        Self::new(offset, timestamp, Bytes::new(), Payload::Control(message))
    }

    pub fn with_upstream(mut self, upstream: UpstreamPosition) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn control_message(&self) -> Option<ControlMessage> {
        match self.payload {
            Payload::Control(message) => Some(message),
            _ => None,
        }
    }

    /// Estimate the size of this record in bytes
    pub fn estimated_size(&self) -> usize {
        let payload = match &self.payload {
            Payload::Put(value) => value.len(),
            Payload::Delete | Payload::Control(_) => 0,
            Payload::Update(update) => update.estimated_size(),
        };

        8 + // offset
        8 + // timestamp
        self.key.len() +
        payload
    }
}
