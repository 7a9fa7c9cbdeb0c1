//! Tuning defaults shared between configuration and tests.

use std::time::Duration;

/// Default byte budget for the snapshot cache.
pub(crate) const DEFAULT_SNAPSHOT_CACHE_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Default wall-clock horizon after which replica entries become trimmable.
pub(crate) const DEFAULT_RETENTION_HORIZON_SECS: u64 = 3600;

/// Fixed per-entry overhead charged against the snapshot-cache byte budget,
/// covering key storage and map bookkeeping beyond the serialized payload.
pub(crate) const CACHED_DEFINITION_OVERHEAD_BYTES: usize = 96;

/// Bounds for the retention pass period derived from the horizon.
pub(crate) const RETENTION_TICK_MIN: Duration = Duration::from_secs(1);
pub(crate) const RETENTION_TICK_MAX: Duration = Duration::from_secs(300);
