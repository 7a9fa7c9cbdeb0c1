//! Configuration for the schema caching proxy.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH`)
//! - Environment variable overrides (highest priority)

mod cache;
mod retry;

pub use cache::*;
pub use retry::*;


use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Main configuration container for the schema caching proxy.
///
/// Sources are merged in the following order (later sources override
/// earlier ones):
/// 1. Type defaults (lowest priority)
/// 2. Configuration file from the `CONFIG_PATH` environment variable
/// 3. Environment variables with the `SCHEMA_PROXY__` prefix
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SchemaProxyConfig {
    /// Snapshot cache sizing
    #[serde(default)]
    pub snapshot: SnapshotCacheConfig,

    /// Watching cache behavior and stream-recovery policy
    #[serde(default)]
    pub watching: WatchingCacheConfig,
}

impl SchemaProxyConfig {
    /// Builds the merged configuration and validates it.
    ///
    /// # Example
    /// ```ignore
    /// std::env::set_var("SCHEMA_PROXY__SNAPSHOT__MAX_BYTES", "16777216");
    /// let config = SchemaProxyConfig::new()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path));
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEMA_PROXY")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-component configuration rules.
    pub fn validate(&self) -> Result<()> {
        self.snapshot.validate()?;
        self.watching.validate()?;
        Ok(())
    }
}
