//! Ingestion Configuration
//!
//! ## IngestionConfig
//!
//! Host-wide settings shared by every replica:
//!
//! - **poll_batch_size**: Maximum records returned by one poll (default: 500)
//! - **poll_interval**: Idle wait after an empty poll (default: 50ms)
//! - **bootstrap_timeout**: Push SLA; no end of push within it raises the push-timeout flag (default: 1h)
//! - **stale_grace**: How long source failures persist before a replica reports itself stale (default: 30s)
//! - **initial_backoff** / **max_backoff**: Capped exponential retry delay (default: 100ms / 5s)
//! - **local_region**: Name of this region, used in per-region metric names (default: "local")
//! - **producer_cache_capacity**: Version-topic producer handles kept open (default: 1024)
//!
//! ## StoreVersionConfig
//!
//! Immutable per replica. `hybrid` is `Some` for versions that keep ingesting a
//! real-time topic after the batch push.
//!
//! ## Usage
//!
//! ```ignore
//! let config = IngestionConfig {
//!     local_region: "dc0".to_string(),
//!     ..Default::default()
//! };
//!
//! let version = StoreVersionConfig {
//!     hybrid: Some(HybridConfig { rewind_seconds: 3600, offset_lag_threshold: 1000 }),
//!     ..Default::default()
//! };
//! ```

use crate::error::{IngestionError, Result};
use replicore_core::{RegionId, ValueSchema};
use replicore_observability::ReplicaProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,

    #[serde(default = "default_poll_interval", with = "duration_ms")]
    pub poll_interval: Duration,

    #[serde(default = "default_bootstrap_timeout", with = "duration_ms")]
    pub bootstrap_timeout: Duration,

    #[serde(default = "default_stale_grace", with = "duration_ms")]
    pub stale_grace: Duration,

    #[serde(default = "default_initial_backoff", with = "duration_ms")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "duration_ms")]
    pub max_backoff: Duration,

    #[serde(default = "default_local_region")]
    pub local_region: String,

    #[serde(default = "default_producer_cache_capacity")]
    pub producer_cache_capacity: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            poll_batch_size: default_poll_batch_size(),
            poll_interval: default_poll_interval(),
            bootstrap_timeout: default_bootstrap_timeout(),
            stale_grace: default_stale_grace(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            local_region: default_local_region(),
            producer_cache_capacity: default_producer_cache_capacity(),
        }
    }
}

impl IngestionConfig {
    /// Read overrides from `REPLICORE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(size) = env_parse::<usize>("REPLICORE_POLL_BATCH_SIZE")? {
            config.poll_batch_size = size;
        }
        if let Some(ms) = env_parse::<u64>("REPLICORE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("REPLICORE_BOOTSTRAP_TIMEOUT_MS")? {
            config.bootstrap_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("REPLICORE_STALE_GRACE_MS")? {
            config.stale_grace = Duration::from_millis(ms);
        }
        if let Ok(region) = std::env::var("REPLICORE_LOCAL_REGION") {
            config.local_region = region;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_batch_size == 0 {
            return Err(IngestionError::Configuration(
                "poll_batch_size must be positive".to_string(),
            ));
        }
        if self.initial_backoff.is_zero() || self.max_backoff < self.initial_backoff {
            return Err(IngestionError::Configuration(format!(
                "invalid backoff range {:?}..{:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| IngestionError::Configuration(format!("{} is not valid: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn default_poll_batch_size() -> usize {
    500
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_bootstrap_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_stale_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_local_region() -> String {
    "local".to_string()
}

fn default_producer_cache_capacity() -> u64 {
    1024
}

/// Real-time ingestion settings of a hybrid version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridConfig {
    /// How far back a leader starts reading the real-time topic when it has
    /// no upstream position yet
    pub rewind_seconds: u64,

    /// Real-time lag at or below which the replica may serve reads
    pub offset_lag_threshold: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreVersionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hybrid: Option<HybridConfig>,

    #[serde(default)]
    pub active_active: bool,

    /// Remote regions and their aliases
    #[serde(default)]
    pub regions: BTreeMap<RegionId, String>,

    /// Schema partial updates are merged against
    #[serde(default)]
    pub value_schema: ValueSchema,
}

impl StoreVersionConfig {
    pub fn is_hybrid(&self) -> bool {
        self.hybrid.is_some()
    }

    pub fn offset_lag_threshold(&self) -> Option<u64> {
        self.hybrid.map(|h| h.offset_lag_threshold)
    }

    /// Upstream real-time regions the leader consumes: every configured region
    /// in active-active mode, otherwise the single regionless topic.
    pub fn upstream_regions(&self) -> Vec<Option<RegionId>> {
        if self.active_active {
            self.regions.keys().map(|r| Some(*r)).collect()
        } else {
            vec![None]
        }
    }

    pub fn profile(&self) -> ReplicaProfile {
        ReplicaProfile {
            hybrid: self.is_hybrid(),
            active_active: self.active_active,
            regions: self.regions.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.active_active && self.hybrid.is_none() {
            return Err(IngestionError::Configuration(
                "active-active replication requires a hybrid version".to_string(),
            ));
        }
        if self.active_active && self.regions.is_empty() {
            return Err(IngestionError::Configuration(
                "active-active replication requires at least one region".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helpers for Duration serialization as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
