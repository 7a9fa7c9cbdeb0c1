//! Watching schema cache.
//!
//! Maintains a live, revision-indexed in-memory replica of all schema
//! definitions by consuming the store's schema-change stream. Reads at or
//! below the cache's checkpoint are served from memory; reads above it, and
//! every read while the stream is down, fall through to the snapshot cache.
//!
//! State machine: `Uninitialized → Running ⇄ Fallback → Closed`. On stream
//! failure the worker clears everything it learned (gaps make the replica
//! untrustworthy), serves reads through the fallback proxy, and
//! re-subscribes from the store's current head with exponential backoff.
//!
//! Locking: each kind's entry map, its checkpoint, and its fallback flag
//! share one readers-writer lock, so a reader never observes a partially
//! updated `(entries, checkpoint, fallback)` triple. The worker holds the
//! write side only per message.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::cache::snapshot::CachingDatastoreProxy;
use crate::cache::versioned::VersionedEntries;
use crate::config::BackoffPolicy;
use crate::config::SchemaProxyConfig;
use crate::constants::RETENTION_TICK_MAX;
use crate::constants::RETENTION_TICK_MIN;
use crate::metrics::REPLICA_READS;
use crate::metrics::WATCH_FALLBACK_MODE;
use crate::proto::schema::CaveatDefinition;
use crate::proto::schema::NamespaceDefinition;
use crate::storage::ChangedDefinition;
use crate::storage::Revision;
use crate::storage::RevisionedDefinition;
use crate::storage::SchemaDatastore;
use crate::storage::SchemaDefinition;
use crate::storage::SchemaReader;
use crate::storage::SchemaState;
use crate::storage::SchemaWatch;
use crate::storage::TxBody;
use crate::ProxyError;
use crate::Result;

/// Replica state for one definition kind. Checkpoint and fallback flag live
/// inside the same lock domain as the entries.
struct KindState<D> {
    entries: HashMap<String, VersionedEntries<D>>,
    checkpoint: Option<Revision>,
    fallback_mode: bool,
}

pub(crate) struct KindCache<D> {
    state: RwLock<KindState<D>>,
}

impl<D: SchemaDefinition> KindCache<D> {
    fn new() -> Self {
        Self {
            state: RwLock::new(KindState {
                entries: HashMap::new(),
                checkpoint: None,
                fallback_mode: false,
            }),
        }
    }

    fn apply_change(
        &self,
        revision: Revision,
        name: &str,
        definition: Option<D>,
    ) -> std::result::Result<(), ProxyError> {
        let mut state = self.state.write();
        state.entries.entry(name.to_string()).or_default().append(revision, definition)
    }

    /// Monotonic: ignored when the checkpoint is already at or above
    /// `revision`.
    fn advance_checkpoint(
        &self,
        revision: Revision,
    ) {
        let mut state = self.state.write();
        if state.checkpoint.map_or(true, |checkpoint| checkpoint < revision) {
            state.checkpoint = Some(revision);
        }
    }

    fn initialize_at(
        &self,
        head: Revision,
    ) {
        let mut state = self.state.write();
        state.checkpoint = Some(head);
        state.fallback_mode = false;
    }

    /// Entries learned before the failure are discarded: a gap in the stream
    /// means the replica can no longer be trusted at any revision.
    fn enter_fallback(
        &self,
        kind: &str,
    ) {
        let mut state = self.state.write();
        state.entries.clear();
        state.checkpoint = None;
        state.fallback_mode = true;
        WATCH_FALLBACK_MODE.with_label_values(&[kind]).set(1);
    }

    fn recover_at(
        &self,
        head: Revision,
        kind: &str,
    ) {
        let mut state = self.state.write();
        state.checkpoint = Some(head);
        state.fallback_mode = false;
        WATCH_FALLBACK_MODE.with_label_values(&[kind]).set(0);
    }

    fn trim_observed_before(
        &self,
        cutoff: Instant,
    ) {
        let mut state = self.state.write();
        for entries in state.entries.values_mut() {
            entries.trim_observed_before(cutoff);
        }
    }

    #[cfg(test)]
    pub(crate) fn in_fallback_mode(&self) -> bool {
        self.state.read().fallback_mode
    }
}

/// Outcome of consulting the replica for one name.
enum ReplicaRead<D> {
    /// Served from memory.
    Hit { definition: D, last_written: Revision },
    /// Authoritative negative: tombstoned, or never observed while the
    /// checkpoint covers the read revision.
    Missing,
    /// The replica cannot answer; consult the backing store.
    Fallthrough,
}

/// Selects the kind cache for a definition type.
pub(crate) trait HasKindCache<D: SchemaDefinition> {
    fn kind_cache(&self) -> &KindCache<D>;
}

pub(crate) struct WatchingCore<DS> {
    inner: Arc<DS>,
    fallback: CachingDatastoreProxy<DS>,
    namespaces: KindCache<NamespaceDefinition>,
    caveats: KindCache<CaveatDefinition>,
    started: AtomicBool,
    closed: AtomicBool,
    backoff: BackoffPolicy,
    retention_horizon: Option<Duration>,
}

impl<DS: SchemaDatastore> HasKindCache<NamespaceDefinition> for WatchingCore<DS> {
    fn kind_cache(&self) -> &KindCache<NamespaceDefinition> {
        &self.namespaces
    }
}

impl<DS: SchemaDatastore> HasKindCache<CaveatDefinition> for WatchingCore<DS> {
    fn kind_cache(&self) -> &KindCache<CaveatDefinition> {
        &self.caveats
    }
}

impl<DS: SchemaDatastore> WatchingCore<DS> {
    fn consult_replica<D>(
        &self,
        revision: Revision,
        name: &str,
    ) -> ReplicaRead<D>
    where
        D: SchemaDefinition,
        Self: HasKindCache<D>,
    {
        let state = <Self as HasKindCache<D>>::kind_cache(self).state.read();

        if state.fallback_mode {
            return ReplicaRead::Fallthrough;
        }

        // Above the checkpoint the stream has not yet proven completeness,
        // so the replica cannot answer even for names it holds.
        match state.checkpoint {
            Some(checkpoint) if revision.less_or_equal(&checkpoint) => {}
            _ => return ReplicaRead::Fallthrough,
        }

        match state.entries.get(name) {
            Some(entries) => match entries.lookup(revision) {
                Some(entry) => match entry.definition() {
                    Some(definition) => ReplicaRead::Hit {
                        definition: definition.clone(),
                        last_written: entry.revision(),
                    },
                    None => ReplicaRead::Missing,
                },
                // Every observation of this name is above the read revision;
                // its earlier history is unknown.
                None => ReplicaRead::Fallthrough,
            },
            None => ReplicaRead::Missing,
        }
    }

    fn apply_state(
        &self,
        state: &SchemaState,
    ) -> std::result::Result<(), ProxyError> {
        trace!(revision = %state.revision, is_checkpoint = state.is_checkpoint, "applying schema state");

        if !state.is_checkpoint {
            for changed in &state.changed_definitions {
                match changed {
                    ChangedDefinition::Namespace(definition) => {
                        self.namespaces
                            .apply_change(state.revision, &definition.name, Some(definition.clone()))?
                    }
                    ChangedDefinition::Caveat(definition) => {
                        self.caveats
                            .apply_change(state.revision, &definition.name, Some(definition.clone()))?
                    }
                }
            }
            for name in &state.deleted_namespaces {
                self.namespaces.apply_change(state.revision, name, None)?;
            }
            for name in &state.deleted_caveats {
                self.caveats.apply_change(state.revision, name, None)?;
            }
        }

        // The stream is revision-ordered: any message at R proves no change
        // below R remains undelivered, so changes advance the checkpoint the
        // same way checkpoint markers do.
        self.namespaces.advance_checkpoint(state.revision);
        self.caveats.advance_checkpoint(state.revision);
        Ok(())
    }

    fn enter_fallback(&self) {
        warn!("schema watch degraded; serving reads from the backing store");
        self.namespaces.enter_fallback("namespace");
        self.caveats.enter_fallback("caveat");
    }

    fn recover_at(
        &self,
        head: Revision,
    ) {
        self.namespaces.recover_at(head, "namespace");
        self.caveats.recover_at(head, "caveat");
    }

    fn trim_expired(
        &self,
        horizon: Duration,
    ) {
        let Some(cutoff) = Instant::now().checked_sub(horizon) else {
            return;
        };
        self.namespaces.trim_observed_before(cutoff);
        self.caveats.trim_observed_before(cutoff);
    }
}

/// Watching-cache proxy around a [`SchemaDatastore`].
///
/// Construct with [`WatchingCacheProxy::new`], then call
/// [`start`](Self::start) to subscribe the schema-change stream. Reads
/// before `start` (and after [`close`](Self::close)) fail.
pub struct WatchingCacheProxy<DS> {
    core: Arc<WatchingCore<DS>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<DS: SchemaDatastore> WatchingCacheProxy<DS> {
    pub fn new(
        inner: Arc<DS>,
        config: &SchemaProxyConfig,
    ) -> Self {
        let fallback = CachingDatastoreProxy::new(Arc::clone(&inner), &config.snapshot);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            core: Arc::new(WatchingCore {
                inner,
                fallback,
                namespaces: KindCache::new(),
                caveats: KindCache::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                backoff: config.watching.backoff,
                retention_horizon: config.watching.retention_horizon(),
            }),
            worker: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Subscribes the schema-change stream from the store's current head and
    /// spawns the background worker. The head revision becomes the initial
    /// checkpoint for both kinds.
    pub async fn start(&self) -> Result<()> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed.into());
        }
        if self.core.started.swap(true, Ordering::AcqRel) {
            return Err(ProxyError::AlreadyStarted.into());
        }

        let head = match self.core.inner.head_revision().await {
            Ok(head) => head,
            Err(error) => {
                self.core.started.store(false, Ordering::Release);
                return Err(error);
            }
        };

        let schema_watch = self.core.inner.watch_schema(head);
        self.core.namespaces.initialize_at(head);
        self.core.caveats.initialize_at(head);

        let worker = WatchWorker {
            core: Arc::clone(&self.core),
            shutdown: self.shutdown_tx.subscribe(),
        };
        *self.worker.lock() = Some(tokio::spawn(worker.run(schema_watch)));

        info!(%head, "watching schema cache started");
        Ok(())
    }

    /// Cancels the stream worker. Idempotent; in-flight reads complete.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        debug!("watching schema cache closed");
    }

    #[cfg(test)]
    pub(crate) fn namespace_cache(&self) -> &KindCache<NamespaceDefinition> {
        &self.core.namespaces
    }

    #[cfg(test)]
    pub(crate) fn caveat_cache(&self) -> &KindCache<CaveatDefinition> {
        &self.core.caveats
    }
}

impl<DS> Drop for WatchingCacheProxy<DS> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl<DS: SchemaDatastore> SchemaDatastore for WatchingCacheProxy<DS> {
    fn snapshot_reader(
        &self,
        revision: Revision,
    ) -> Arc<dyn SchemaReader> {
        Arc::new(WatchingSnapshotReader {
            core: Arc::clone(&self.core),
            fallback: self.core.fallback.snapshot_reader(revision),
            revision,
        })
    }

    async fn head_revision(&self) -> Result<Revision> {
        self.core.inner.head_revision().await
    }

    fn watch_schema(
        &self,
        from_revision: Revision,
    ) -> SchemaWatch {
        self.core.inner.watch_schema(from_revision)
    }

    async fn read_write_tx(
        &self,
        body: TxBody,
    ) -> Result<Revision> {
        // Transactions use the snapshot proxy's transaction-local cache;
        // the replica is never consulted inside a transaction.
        self.core.fallback.read_write_tx(body).await
    }
}

/// Per-revision reader: replica first, snapshot cache on fallthrough.
struct WatchingSnapshotReader<DS> {
    core: Arc<WatchingCore<DS>>,
    fallback: Arc<dyn SchemaReader>,
    revision: Revision,
}

impl<DS: SchemaDatastore> WatchingSnapshotReader<DS> {
    async fn read_definition<D>(
        &self,
        name: &str,
    ) -> Result<(D, Revision)>
    where
        D: SchemaDefinition,
        WatchingCore<DS>: HasKindCache<D>,
    {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed.into());
        }

        match self.core.consult_replica::<D>(self.revision, name) {
            ReplicaRead::Hit {
                definition,
                last_written,
            } => {
                REPLICA_READS.with_label_values(&[D::kind().as_str(), "hit"]).inc();
                Ok((definition, last_written))
            }
            ReplicaRead::Missing => {
                REPLICA_READS
                    .with_label_values(&[D::kind().as_str(), "negative"])
                    .inc();
                Err(D::not_found(name).into())
            }
            ReplicaRead::Fallthrough => {
                REPLICA_READS
                    .with_label_values(&[D::kind().as_str(), "fallthrough"])
                    .inc();
                D::read_via(self.fallback.as_ref(), name).await
            }
        }
    }

    async fn lookup_definitions<D>(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<D>>>
    where
        D: SchemaDefinition,
        WatchingCore<DS>: HasKindCache<D>,
    {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed.into());
        }

        // Replica-resolvable only below the checkpoint and outside fallback;
        // then every name resolves in memory, filtering tombstones and
        // absences.
        let resolved = {
            let state = <WatchingCore<DS> as HasKindCache<D>>::kind_cache(&self.core).state.read();
            let covered = !state.fallback_mode
                && state
                    .checkpoint
                    .is_some_and(|checkpoint| self.revision.less_or_equal(&checkpoint));

            covered.then(|| {
                names
                    .iter()
                    .filter_map(|name| {
                        let entry = state.entries.get(name)?.lookup(self.revision)?;
                        let definition = entry.definition()?.clone();
                        Some(RevisionedDefinition {
                            definition,
                            last_written_revision: entry.revision(),
                        })
                    })
                    .collect::<Vec<_>>()
            })
        };

        match resolved {
            Some(found) => {
                REPLICA_READS
                    .with_label_values(&[D::kind().as_str(), "hit"])
                    .inc_by(names.len() as u64);
                Ok(found)
            }
            None => {
                REPLICA_READS
                    .with_label_values(&[D::kind().as_str(), "fallthrough"])
                    .inc_by(names.len() as u64);
                D::lookup_via(self.fallback.as_ref(), names).await
            }
        }
    }
}

#[async_trait]
impl<DS: SchemaDatastore> SchemaReader for WatchingSnapshotReader<DS> {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> Result<(NamespaceDefinition, Revision)> {
        self.read_definition(name).await
    }

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> Result<(CaveatDefinition, Revision)> {
        self.read_definition(name).await
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        self.lookup_definitions(names).await
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<CaveatDefinition>>> {
        self.lookup_definitions(names).await
    }
}

/// Background consumer of the schema-change stream.
///
/// A single long-lived task that selects over the value stream, the error
/// stream, the shutdown signal, and the optional retention tick. Any stream
/// failure (terminal error, closed channel, ordering violation) degrades the
/// cache into fallback mode and triggers re-subscription with exponential
/// backoff.
struct WatchWorker<DS> {
    core: Arc<WatchingCore<DS>>,
    shutdown: watch::Receiver<bool>,
}

impl<DS: SchemaDatastore> WatchWorker<DS> {
    async fn run(
        mut self,
        mut schema_watch: SchemaWatch,
    ) {
        debug!("schema watch worker started");

        let mut retention_tick = self.core.retention_horizon.map(|horizon| {
            let period = (horizon / 4).clamp(RETENTION_TICK_MIN, RETENTION_TICK_MAX);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval
        });
        let mut errors_open = true;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!("schema watch worker stopping");
                    return;
                }

                state = schema_watch.states.recv() => {
                    let failure = match state {
                        Some(state) => match self.core.apply_state(&state) {
                            Ok(()) => None,
                            Err(error) => Some(ProxyError::StreamFailed(error.to_string())),
                        },
                        None => Some(ProxyError::StreamFailed("schema stream closed".to_string())),
                    };

                    if let Some(failure) = failure {
                        warn!(%failure, "schema watch stream failed");
                        match self.resubscribe().await {
                            Some(watch) => {
                                schema_watch = watch;
                                errors_open = true;
                            }
                            None => return,
                        }
                    }
                }

                error = schema_watch.errors.recv(), if errors_open => {
                    match error {
                        Some(error) => {
                            warn!(%error, "schema watch stream reported terminal error");
                            match self.resubscribe().await {
                                Some(watch) => {
                                    schema_watch = watch;
                                    errors_open = true;
                                }
                                None => return,
                            }
                        }
                        // A closed error channel with a live value stream is
                        // not a failure; just stop polling it.
                        None => errors_open = false,
                    }
                }

                _ = tick(&mut retention_tick) => {
                    if let Some(horizon) = self.core.retention_horizon {
                        self.core.trim_expired(horizon);
                    }
                }
            }
        }
    }

    /// Enters fallback mode, then retries subscription from the store's
    /// current head until it succeeds, the retry budget is exhausted, or the
    /// proxy closes. On success the head becomes the new checkpoint.
    async fn resubscribe(&mut self) -> Option<SchemaWatch> {
        self.core.enter_fallback();

        let policy = self.core.backoff;
        let mut delay = Duration::from_millis(policy.base_delay_ms);
        let max_delay = Duration::from_millis(policy.max_delay_ms);
        let mut attempts: usize = 0;

        loop {
            if self.core.closed.load(Ordering::Acquire) {
                return None;
            }
            attempts += 1;

            match timeout(Duration::from_millis(policy.timeout_ms), self.core.inner.head_revision()).await {
                Ok(Ok(head)) => {
                    let schema_watch = self.core.inner.watch_schema(head);
                    self.core.recover_at(head);
                    info!(%head, attempts, "schema watch re-established");
                    return Some(schema_watch);
                }
                Ok(Err(error)) => warn!(%error, attempts, "failed to re-establish schema watch"),
                Err(_elapsed) => warn!(attempts, "timed out re-establishing schema watch"),
            }

            if policy.max_retries != 0 && attempts >= policy.max_retries {
                warn!(attempts, "giving up on schema watch; reads stay on the backing store");
                return None;
            }

            tokio::select! {
                _ = self.shutdown.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = delay.mul_f64(policy.multiplier).min(max_delay);
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
