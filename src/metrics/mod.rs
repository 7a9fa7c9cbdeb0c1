//! Cache metrics.
//!
//! Collectors are process-global; the host owns exposition and may register
//! them into its own registry via [`register_metrics`].

use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;

lazy_static! {
    pub static ref SNAPSHOT_CACHE_READS: IntCounterVec = IntCounterVec::new(
        Opts::new("schema_snapshot_cache_reads", "Snapshot schema cache reads by kind and outcome"),
        &["kind", "outcome"]
    )
    .expect("metric can not be created");
    pub static ref REPLICA_READS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "schema_replica_reads",
            "Watching schema cache reads by kind and outcome"
        ),
        &["kind", "outcome"]
    )
    .expect("metric can not be created");
    pub static ref TX_CACHE_READS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "schema_tx_cache_reads",
            "Transaction-local schema cache reads by kind and outcome"
        ),
        &["kind", "outcome"]
    )
    .expect("metric can not be created");
    pub static ref SINGLEFLIGHT_READS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "schema_singleflight_reads",
            "Single-flight cache fills by role (owned or shared)"
        ),
        &["role"]
    )
    .expect("metric can not be created");
    pub static ref WATCH_FALLBACK_MODE: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "schema_watch_fallback_mode",
            "Whether the watching cache is in fallback mode, per kind"
        ),
        &["kind"]
    )
    .expect("metric can not be created");
}

/// Registers every proxy collector with `registry`. Double registration is
/// logged and skipped, not an error.
pub fn register_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SNAPSHOT_CACHE_READS.clone()),
        Box::new(REPLICA_READS.clone()),
        Box::new(TX_CACHE_READS.clone()),
        Box::new(SINGLEFLIGHT_READS.clone()),
        Box::new(WATCH_FALLBACK_MODE.clone()),
    ];

    for collector in collectors {
        if let Err(error) = registry.register(collector) {
            warn!(%error, "skipping metric registration");
        }
    }
}
