//! Replicore Core
//!
//! Building blocks of the ingestion core that carry no I/O and no shared state:
//!
//! - **record**: change-log records and control messages
//! - **topic**: replica identity, roles and topic naming
//! - **lag**: offset-lag accounting and readiness decisions
//! - **write_compute**: deterministic partial-update merging

pub mod error;
pub mod lag;
pub mod record;
pub mod topic;
pub mod write_compute;

pub use error::{Error, Result};
pub use lag::{offset_lag, over_threshold, LagSnapshot, OffsetLagTracker};
pub use record::{ChangeRecord, ControlMessage, Payload, UpstreamPosition};
pub use topic::{parse_topic, RegionId, ReplicaId, Role, TopicKind, TopicPartition};
pub use write_compute::{
    apply_update, FieldKind, FieldSchema, FieldUpdate, ValueSchema, WriteComputeRecord,
};
