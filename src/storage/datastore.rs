//! Traits the caching proxy requires from the backing schema store, plus the
//! schema-change stream message types.
//!
//! Namespaces and caveats share the same cache shape but live in disjoint
//! name spaces. The [`SchemaDefinition`] trait captures the capability set
//! the caches need (kind tag, name, serialized form, per-kind reader
//! dispatch), instantiated once per kind so the cache structures are written
//! generically instead of twice.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
#[cfg(test)]
use mockall::automock;
use prost::Message;
use tokio::sync::mpsc;

use crate::proto::schema::CaveatDefinition;
use crate::proto::schema::NamespaceDefinition;
use crate::storage::Revision;
use crate::Result;
use crate::StorageError;

/// The two schema definition kinds, indexed separately throughout the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    Namespace,
    Caveat,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionKind::Namespace => "namespace",
            DefinitionKind::Caveat => "caveat",
        }
    }
}

impl fmt::Display for DefinitionKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A definition paired with the revision at which it was last written.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionedDefinition<D> {
    pub definition: D,
    pub last_written_revision: Revision,
}

pub type RevisionedNamespace = RevisionedDefinition<NamespaceDefinition>;
pub type RevisionedCaveat = RevisionedDefinition<CaveatDefinition>;

/// Capability set shared by the two definition kinds.
#[async_trait]
pub trait SchemaDefinition: Clone + PartialEq + Send + Sync + 'static {
    fn kind() -> DefinitionKind;

    fn name(&self) -> &str;

    /// Canonical serialized form, used for equality and size accounting.
    fn serialized(&self) -> Bytes;

    /// Reads one definition of this kind through a snapshot reader.
    async fn read_via(
        reader: &dyn SchemaReader,
        name: &str,
    ) -> Result<(Self, Revision)>;

    /// Looks up definitions of this kind through a snapshot reader,
    /// returning only those present.
    async fn lookup_via(
        reader: &dyn SchemaReader,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<Self>>>;

    /// Reads one definition of this kind through a transactional reader.
    async fn read_tx_via(
        tx: &dyn SchemaTransaction,
        name: &str,
    ) -> Result<(Self, Revision)>;

    fn not_found(name: &str) -> StorageError {
        StorageError::DefinitionNotFound {
            kind: Self::kind(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl SchemaDefinition for NamespaceDefinition {
    fn kind() -> DefinitionKind {
        DefinitionKind::Namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn serialized(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    async fn read_via(
        reader: &dyn SchemaReader,
        name: &str,
    ) -> Result<(Self, Revision)> {
        reader.read_namespace_by_name(name).await
    }

    async fn lookup_via(
        reader: &dyn SchemaReader,
        names: &[String],
    ) -> Result<Vec<RevisionedNamespace>> {
        reader.lookup_namespaces_with_names(names).await
    }

    async fn read_tx_via(
        tx: &dyn SchemaTransaction,
        name: &str,
    ) -> Result<(Self, Revision)> {
        tx.read_namespace_by_name(name).await
    }
}

#[async_trait]
impl SchemaDefinition for CaveatDefinition {
    fn kind() -> DefinitionKind {
        DefinitionKind::Caveat
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn serialized(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    async fn read_via(
        reader: &dyn SchemaReader,
        name: &str,
    ) -> Result<(Self, Revision)> {
        reader.read_caveat_by_name(name).await
    }

    async fn lookup_via(
        reader: &dyn SchemaReader,
        names: &[String],
    ) -> Result<Vec<RevisionedCaveat>> {
        reader.lookup_caveats_with_names(names).await
    }

    async fn read_tx_via(
        tx: &dyn SchemaTransaction,
        name: &str,
    ) -> Result<(Self, Revision)> {
        tx.read_caveat_by_name(name).await
    }
}

/// A definition change carried by one stream message.
#[derive(Debug, Clone)]
pub enum ChangedDefinition {
    Namespace(NamespaceDefinition),
    Caveat(CaveatDefinition),
}

/// One event on the schema-change stream.
///
/// Carries a revision and either definition changes, deletions, or a
/// checkpoint marker asserting that no change at any revision at or below
/// `revision` remains undelivered.
#[derive(Debug, Clone, Default)]
pub struct SchemaState {
    pub revision: Revision,
    pub is_checkpoint: bool,
    pub changed_definitions: Vec<ChangedDefinition>,
    pub deleted_namespaces: Vec<String>,
    pub deleted_caveats: Vec<String>,
}

impl SchemaState {
    pub fn checkpoint(revision: Revision) -> Self {
        Self {
            revision,
            is_checkpoint: true,
            ..Default::default()
        }
    }

    pub fn changed(
        revision: Revision,
        changed_definitions: Vec<ChangedDefinition>,
    ) -> Self {
        Self {
            revision,
            changed_definitions,
            ..Default::default()
        }
    }
}

/// Subscription handle returned by [`SchemaDatastore::watch_schema`]: the
/// value stream plus a channel yielding at most one terminal error.
pub struct SchemaWatch {
    pub states: mpsc::UnboundedReceiver<SchemaState>,
    pub errors: mpsc::UnboundedReceiver<StorageError>,
}

/// The body of a read/write transaction. Receives a transactional
/// reader+writer whose reads are memoized per name for the transaction's
/// lifetime.
pub type TxBody = Box<dyn for<'a> FnOnce(&'a dyn SchemaTransaction) -> BoxFuture<'a, Result<()>> + Send>;

/// A cheap, stateless per-revision view of the schema store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaReader: Send + Sync {
    /// Reads one namespace, returning the definition and the revision at
    /// which it was last written. Errors with
    /// [`StorageError::DefinitionNotFound`] when absent at this revision.
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> Result<(NamespaceDefinition, Revision)>;

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> Result<(CaveatDefinition, Revision)>;

    /// Returns the named namespaces present at this revision; absent names
    /// are skipped, not errors.
    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedNamespace>>;

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedCaveat>>;
}

/// The reader+writer surface handed to a read/write transaction body.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaTransaction: Send + Sync {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> Result<(NamespaceDefinition, Revision)>;

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> Result<(CaveatDefinition, Revision)>;

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedNamespace>>;

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedCaveat>>;

    async fn write_namespaces(
        &self,
        definitions: Vec<NamespaceDefinition>,
    ) -> Result<()>;

    async fn delete_namespaces(
        &self,
        names: Vec<String>,
    ) -> Result<()>;

    async fn write_caveats(
        &self,
        definitions: Vec<CaveatDefinition>,
    ) -> Result<()>;

    async fn delete_caveats(
        &self,
        names: Vec<String>,
    ) -> Result<()>;
}

/// The backing schema store contract the proxy wraps. Both caching proxies
/// implement this trait themselves, so layers compose transparently.
#[async_trait]
pub trait SchemaDatastore: Send + Sync + 'static {
    /// Returns a cheap per-revision read view.
    fn snapshot_reader(
        &self,
        revision: Revision,
    ) -> Arc<dyn SchemaReader>;

    /// The store's current head revision.
    async fn head_revision(&self) -> Result<Revision>;

    /// Subscribes to schema changes committed after `from_revision`.
    fn watch_schema(
        &self,
        from_revision: Revision,
    ) -> SchemaWatch;

    /// Runs `body` inside a read/write transaction and returns the commit
    /// revision.
    async fn read_write_tx(
        &self,
        body: TxBody,
    ) -> Result<Revision>;
}
