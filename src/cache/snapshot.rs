//! Snapshot schema cache.
//!
//! Wraps a [`SchemaDatastore`] with a byte-bounded cache keyed by
//! `(revision fingerprint, kind, name)`. Misses coalesce through the
//! single-flight group so N concurrent readers of one key cost one backing
//! read. `DefinitionNotFound` is propagated, never cached: authoritative
//! negatives are the watching cache's job.
//!
//! Read/write transactions bypass this cache entirely. Each transaction gets
//! its own read-memoization keyed by `(kind, name)`, discarded when the
//! transaction ends, so reads inside a transaction never observe external
//! cache state.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use moka::future::Cache;
use tracing::debug;
use tracing::trace;

use crate::cache::singleflight::Group;
use crate::config::SnapshotCacheConfig;
use crate::constants::CACHED_DEFINITION_OVERHEAD_BYTES;
use crate::metrics::SNAPSHOT_CACHE_READS;
use crate::metrics::TX_CACHE_READS;
use crate::proto::schema::CaveatDefinition;
use crate::proto::schema::NamespaceDefinition;
use crate::storage::DefinitionKind;
use crate::storage::Revision;
use crate::storage::RevisionedDefinition;
use crate::storage::SchemaDatastore;
use crate::storage::SchemaDefinition;
use crate::storage::SchemaReader;
use crate::storage::SchemaTransaction;
use crate::storage::SchemaWatch;
use crate::storage::TxBody;
use crate::Result;

/// Snapshot-cache key. The revision component is the canonical fingerprint,
/// not identity, so independently constructed readers at one revision share
/// entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SnapshotKey {
    revision: Bytes,
    kind: DefinitionKind,
    name: String,
}

impl SnapshotKey {
    fn new(
        revision: &Revision,
        kind: DefinitionKind,
        name: &str,
    ) -> Self {
        Self {
            revision: revision.fingerprint(),
            kind,
            name: name.to_string(),
        }
    }
}

/// A cached read outcome: either kind's definition plus its last-written
/// revision.
#[derive(Debug, Clone)]
pub(crate) enum CachedDefinition {
    Namespace(RevisionedDefinition<NamespaceDefinition>),
    Caveat(RevisionedDefinition<CaveatDefinition>),
}

impl CachedDefinition {
    fn weight(&self) -> u32 {
        let payload = match self {
            CachedDefinition::Namespace(entry) => entry.definition.serialized().len() + entry.definition.name().len(),
            CachedDefinition::Caveat(entry) => entry.definition.serialized().len() + entry.definition.name().len(),
        };
        (payload + CACHED_DEFINITION_OVERHEAD_BYTES).try_into().unwrap_or(u32::MAX)
    }
}

/// Per-kind packing into the shared cache value.
pub(crate) trait CacheableDefinition: SchemaDefinition {
    fn wrap(entry: RevisionedDefinition<Self>) -> CachedDefinition;

    fn unwrap(cached: CachedDefinition) -> Option<RevisionedDefinition<Self>>;
}

impl CacheableDefinition for NamespaceDefinition {
    fn wrap(entry: RevisionedDefinition<Self>) -> CachedDefinition {
        CachedDefinition::Namespace(entry)
    }

    fn unwrap(cached: CachedDefinition) -> Option<RevisionedDefinition<Self>> {
        match cached {
            CachedDefinition::Namespace(entry) => Some(entry),
            CachedDefinition::Caveat(_) => None,
        }
    }
}

impl CacheableDefinition for CaveatDefinition {
    fn wrap(entry: RevisionedDefinition<Self>) -> CachedDefinition {
        CachedDefinition::Caveat(entry)
    }

    fn unwrap(cached: CachedDefinition) -> Option<RevisionedDefinition<Self>> {
        match cached {
            CachedDefinition::Caveat(entry) => Some(entry),
            CachedDefinition::Namespace(_) => None,
        }
    }
}

struct SnapshotCacheShared<DS> {
    inner: Arc<DS>,
    cache: Cache<SnapshotKey, CachedDefinition>,
    flights: Group<SnapshotKey, CachedDefinition>,
}

impl<DS: SchemaDatastore> SnapshotCacheShared<DS> {
    async fn read_definition<D: CacheableDefinition>(
        &self,
        revision: Revision,
        name: &str,
    ) -> Result<(D, Revision)> {
        let key = SnapshotKey::new(&revision, D::kind(), name);
        if let Some(entry) = self.cache.get(&key).await.and_then(D::unwrap) {
            SNAPSHOT_CACHE_READS
                .with_label_values(&[D::kind().as_str(), "hit"])
                .inc();
            return Ok((entry.definition, entry.last_written_revision));
        }

        SNAPSHOT_CACHE_READS
            .with_label_values(&[D::kind().as_str(), "miss"])
            .inc();

        let inner = Arc::clone(&self.inner);
        let cache = self.cache.clone();
        let fill_key = key.clone();
        let fill_name = name.to_string();
        let (outcome, shared) = self
            .flights
            .run(key, async move {
                let reader = inner.snapshot_reader(revision);
                let (definition, last_written) = D::read_via(reader.as_ref(), &fill_name).await?;
                let cached = D::wrap(RevisionedDefinition {
                    definition,
                    last_written_revision: last_written,
                });
                cache.insert(fill_key, cached.clone()).await;
                Ok(cached)
            })
            .await;

        trace!(kind = %D::kind(), name, %revision, shared, "snapshot cache fill completed");

        let entry = D::unwrap(outcome?).ok_or_else(kind_mismatch)?;
        Ok((entry.definition, entry.last_written_revision))
    }

    async fn lookup_definitions<D: CacheableDefinition>(
        &self,
        revision: Revision,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<D>>> {
        let mut results = Vec::with_capacity(names.len());
        let mut missing = Vec::new();

        for name in names {
            let key = SnapshotKey::new(&revision, D::kind(), name);
            match self.cache.get(&key).await.and_then(D::unwrap) {
                Some(entry) => {
                    SNAPSHOT_CACHE_READS
                        .with_label_values(&[D::kind().as_str(), "hit"])
                        .inc();
                    results.push(entry);
                }
                None => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            SNAPSHOT_CACHE_READS
                .with_label_values(&[D::kind().as_str(), "miss"])
                .inc_by(missing.len() as u64);

            let reader = self.inner.snapshot_reader(revision);
            for entry in D::lookup_via(reader.as_ref(), &missing).await? {
                let key = SnapshotKey::new(&revision, D::kind(), entry.definition.name());
                self.cache.insert(key, D::wrap(entry.clone())).await;
                results.push(entry);
            }
        }

        Ok(results)
    }
}

// The kind tag inside every key makes this unreachable in practice.
fn kind_mismatch() -> crate::Error {
    crate::StorageError::Unavailable("cached definition kind mismatch".to_string()).into()
}

/// Snapshot-caching proxy around a [`SchemaDatastore`].
pub struct CachingDatastoreProxy<DS> {
    shared: Arc<SnapshotCacheShared<DS>>,
}

impl<DS> Clone for CachingDatastoreProxy<DS> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<DS: SchemaDatastore> CachingDatastoreProxy<DS> {
    pub fn new(
        inner: Arc<DS>,
        config: &SnapshotCacheConfig,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|_key: &SnapshotKey, value: &CachedDefinition| value.weight())
            .build();

        debug!(max_bytes = config.max_bytes, "snapshot schema cache created");

        Self {
            shared: Arc::new(SnapshotCacheShared {
                inner,
                cache,
                flights: Group::new(),
            }),
        }
    }
}

#[async_trait]
impl<DS: SchemaDatastore> SchemaDatastore for CachingDatastoreProxy<DS> {
    fn snapshot_reader(
        &self,
        revision: Revision,
    ) -> Arc<dyn SchemaReader> {
        Arc::new(CachingSnapshotReader {
            shared: Arc::clone(&self.shared),
            revision,
        })
    }

    async fn head_revision(&self) -> Result<Revision> {
        self.shared.inner.head_revision().await
    }

    fn watch_schema(
        &self,
        from_revision: Revision,
    ) -> SchemaWatch {
        self.shared.inner.watch_schema(from_revision)
    }

    async fn read_write_tx(
        &self,
        body: TxBody,
    ) -> Result<Revision> {
        self.shared
            .inner
            .read_write_tx(Box::new(move |tx: &dyn SchemaTransaction| {
                async move {
                    let memoized = TransactionCache::new(tx);
                    body(&memoized).await
                }
                .boxed()
            }))
            .await
    }
}

/// Per-revision reader view over the snapshot cache.
struct CachingSnapshotReader<DS> {
    shared: Arc<SnapshotCacheShared<DS>>,
    revision: Revision,
}

#[async_trait]
impl<DS: SchemaDatastore> SchemaReader for CachingSnapshotReader<DS> {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> Result<(NamespaceDefinition, Revision)> {
        self.shared.read_definition(self.revision, name).await
    }

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> Result<(CaveatDefinition, Revision)> {
        self.shared.read_definition(self.revision, name).await
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        self.shared.lookup_definitions(self.revision, names).await
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<CaveatDefinition>>> {
        self.shared.lookup_definitions(self.revision, names).await
    }
}

/// Transaction-local read memoization.
///
/// The first read of each `(kind, name)` — found or not — is recorded and
/// replayed for the transaction's remaining reads of that name. Writes to a
/// name drop its memoized outcome so a read-after-write observes the write
/// through the transactional reader.
struct TransactionCache<'a> {
    inner: &'a dyn SchemaTransaction,
    outcomes: DashMap<(DefinitionKind, String), Result<CachedDefinition>>,
}

impl<'a> TransactionCache<'a> {
    fn new(inner: &'a dyn SchemaTransaction) -> Self {
        Self {
            inner,
            outcomes: DashMap::new(),
        }
    }

    async fn read_memoized<D: CacheableDefinition>(
        &self,
        name: &str,
    ) -> Result<(D, Revision)> {
        let key = (D::kind(), name.to_string());
        let outcome = match self.outcomes.get(&key) {
            Some(outcome) => {
                TX_CACHE_READS
                    .with_label_values(&[D::kind().as_str(), "hit"])
                    .inc();
                outcome.value().clone()
            }
            None => {
                TX_CACHE_READS
                    .with_label_values(&[D::kind().as_str(), "miss"])
                    .inc();
                let outcome = D::read_tx_via(self.inner, name).await.map(|(definition, last_written)| {
                    D::wrap(RevisionedDefinition {
                        definition,
                        last_written_revision: last_written,
                    })
                });
                self.outcomes.insert(key, outcome.clone());
                outcome
            }
        };

        let entry = D::unwrap(outcome?).ok_or_else(kind_mismatch)?;
        Ok((entry.definition, entry.last_written_revision))
    }

    fn invalidate<I>(
        &self,
        kind: DefinitionKind,
        names: I,
    ) where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for name in names {
            self.outcomes.remove(&(kind, name.as_ref().to_string()));
        }
    }
}

#[async_trait]
impl SchemaTransaction for TransactionCache<'_> {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> Result<(NamespaceDefinition, Revision)> {
        self.read_memoized(name).await
    }

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> Result<(CaveatDefinition, Revision)> {
        self.read_memoized(name).await
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        self.inner.lookup_namespaces_with_names(names).await
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<CaveatDefinition>>> {
        self.inner.lookup_caveats_with_names(names).await
    }

    async fn write_namespaces(
        &self,
        definitions: Vec<NamespaceDefinition>,
    ) -> Result<()> {
        let names: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
        self.inner.write_namespaces(definitions).await?;
        self.invalidate(DefinitionKind::Namespace, names);
        Ok(())
    }

    async fn delete_namespaces(
        &self,
        names: Vec<String>,
    ) -> Result<()> {
        self.inner.delete_namespaces(names.clone()).await?;
        self.invalidate(DefinitionKind::Namespace, names);
        Ok(())
    }

    async fn write_caveats(
        &self,
        definitions: Vec<CaveatDefinition>,
    ) -> Result<()> {
        let names: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
        self.inner.write_caveats(definitions).await?;
        self.invalidate(DefinitionKind::Caveat, names);
        Ok(())
    }

    async fn delete_caveats(
        &self,
        names: Vec<String>,
    ) -> Result<()> {
        self.inner.delete_caveats(names.clone()).await?;
        self.invalidate(DefinitionKind::Caveat, names);
        Ok(())
    }
}
