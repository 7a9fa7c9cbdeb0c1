//! The two layered schema caches and their composition.
//!
//! [`CachingDatastoreProxy`] is the snapshot cache: bounded, keyed by
//! `(revision, name)`, single-flight on misses. [`WatchingCacheProxy`] layers
//! the live stream-fed replica on top, using the snapshot cache as its
//! fallthrough and fallback path.

mod singleflight;
mod snapshot;
mod versioned;
mod watching;

pub use snapshot::CachingDatastoreProxy;
pub use watching::WatchingCacheProxy;

#[cfg(test)]
mod snapshot_test;

use std::sync::Arc;

use tracing::info;

use crate::config::SchemaProxyConfig;
use crate::storage::SchemaDatastore;
use crate::Result;

/// Wraps a datastore in the configured caching layers.
///
/// With watching enabled this subscribes the schema-change stream
/// immediately; otherwise the result is the plain snapshot cache.
pub async fn wrap_with_schema_cache<DS: SchemaDatastore>(
    inner: Arc<DS>,
    config: &SchemaProxyConfig,
) -> Result<Arc<dyn SchemaDatastore>> {
    config.validate()?;

    if config.watching.enabled {
        let proxy = WatchingCacheProxy::new(inner, config);
        proxy.start().await?;
        info!("schema caching proxy running in watching mode");
        Ok(Arc::new(proxy))
    } else {
        info!("schema caching proxy running in snapshot-only mode");
        Ok(Arc::new(CachingDatastoreProxy::new(inner, &config.snapshot)))
    }
}
