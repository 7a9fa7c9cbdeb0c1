use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::config::BackoffPolicy;
use crate::constants::DEFAULT_RETENTION_HORIZON_SECS;
use crate::constants::DEFAULT_SNAPSHOT_CACHE_MAX_BYTES;
use crate::Error;
use crate::Result;

/// Sizing for the bounded snapshot cache.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct SnapshotCacheConfig {
    /// Byte budget for cached definitions. Exceeding it evicts under an
    /// approximate-LFU policy.
    #[serde(default = "default_snapshot_max_bytes")]
    pub max_bytes: u64,
}

impl Default for SnapshotCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_snapshot_max_bytes(),
        }
    }
}

impl SnapshotCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(Error::from(ConfigError::Message(
                "snapshot.max_bytes cannot be 0".to_string(),
            )));
        }
        Ok(())
    }
}

/// Behavior of the watching cache and its stream-recovery policy.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct WatchingCacheConfig {
    /// When false, the proxy serves every read through the snapshot cache
    /// and never subscribes the schema-change stream.
    #[serde(default = "default_watching_enabled")]
    pub enabled: bool,

    /// Wall-clock age after which replica entries become trimmable.
    /// 0 disables the retention pass.
    #[serde(default = "default_retention_horizon_secs")]
    pub retention_horizon_secs: u64,

    /// Re-subscription backoff after a stream failure
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for WatchingCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_watching_enabled(),
            retention_horizon_secs: default_retention_horizon_secs(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WatchingCacheConfig {
    pub fn retention_horizon(&self) -> Option<Duration> {
        (self.retention_horizon_secs != 0).then(|| Duration::from_secs(self.retention_horizon_secs))
    }

    pub fn validate(&self) -> Result<()> {
        self.backoff.validate("watching.backoff")?;
        Ok(())
    }
}

fn default_snapshot_max_bytes() -> u64 {
    DEFAULT_SNAPSHOT_CACHE_MAX_BYTES
}

fn default_watching_enabled() -> bool {
    true
}

fn default_retention_horizon_secs() -> u64 {
    DEFAULT_RETENTION_HORIZON_SECS
}
