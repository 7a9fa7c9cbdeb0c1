//! An in-memory fake of the backing schema store.
//!
//! Keeps revision-ordered versions per name, drives the schema-change stream
//! through real channels, and can disable reads or fail head-revision calls
//! to prove which layer served a request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

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
use crate::Result;
use crate::StorageError;

struct FakeEntry<D> {
    definition: Option<D>,
    last_written: Revision,
    was_deleted: bool,
}

struct FakeState {
    head_revision: Revision,
    namespaces: HashMap<String, Vec<FakeEntry<NamespaceDefinition>>>,
    caveats: HashMap<String, Vec<FakeEntry<CaveatDefinition>>>,
    reads_disabled: bool,
    head_revision_fails: bool,
    schema_tx: Option<mpsc::UnboundedSender<SchemaState>>,
    error_tx: Option<mpsc::UnboundedSender<StorageError>>,
}

#[derive(Clone)]
pub(crate) struct FakeDatastore {
    state: Arc<RwLock<FakeState>>,
}

impl FakeDatastore {
    pub(crate) fn new(head_revision: Revision) -> Self {
        Self {
            state: Arc::new(RwLock::new(FakeState {
                head_revision,
                namespaces: HashMap::new(),
                caveats: HashMap::new(),
                reads_disabled: false,
                head_revision_fails: false,
                schema_tx: None,
                error_tx: None,
            })),
        }
    }

    /// Writes (or, with `None`, deletes) a namespace at `revision` and emits
    /// the matching stream message. Sleeps briefly so the watch worker can
    /// apply the message before the test continues.
    pub(crate) async fn update_namespace(
        &self,
        name: &str,
        definition: Option<NamespaceDefinition>,
        revision: Revision,
    ) {
        {
            let mut state = self.state.write();
            let message = match &definition {
                Some(definition) => SchemaState::changed(revision, vec![ChangedDefinition::Namespace(definition.clone())]),
                None => SchemaState {
                    revision,
                    deleted_namespaces: vec![name.to_string()],
                    ..Default::default()
                },
            };
            let was_deleted = definition.is_none();
            state.namespaces.entry(name.to_string()).or_default().push(FakeEntry {
                definition,
                last_written: revision,
                was_deleted,
            });
            state.head_revision = revision;
            if let Some(tx) = &state.schema_tx {
                let _ = tx.send(message);
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    pub(crate) async fn update_caveat(
        &self,
        name: &str,
        definition: Option<CaveatDefinition>,
        revision: Revision,
    ) {
        {
            let mut state = self.state.write();
            let message = match &definition {
                Some(definition) => SchemaState::changed(revision, vec![ChangedDefinition::Caveat(definition.clone())]),
                None => SchemaState {
                    revision,
                    deleted_caveats: vec![name.to_string()],
                    ..Default::default()
                },
            };
            let was_deleted = definition.is_none();
            state.caveats.entry(name.to_string()).or_default().push(FakeEntry {
                definition,
                last_written: revision,
                was_deleted,
            });
            state.head_revision = revision;
            if let Some(tx) = &state.schema_tx {
                let _ = tx.send(message);
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    pub(crate) async fn send_checkpoint(
        &self,
        revision: Revision,
    ) {
        {
            let state = self.state.read();
            if let Some(tx) = &state.schema_tx {
                let _ = tx.send(SchemaState::checkpoint(revision));
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// Emits a terminal stream error.
    pub(crate) async fn fail_stream(
        &self,
        message: &str,
    ) {
        {
            let state = self.state.read();
            if let Some(tx) = &state.error_tx {
                let _ = tx.send(StorageError::Unavailable(message.to_string()));
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pub(crate) fn disable_reads(&self) {
        self.state.write().reads_disabled = true;
    }

    pub(crate) fn enable_reads(&self) {
        self.state.write().reads_disabled = false;
    }

    /// While set, `head_revision` fails, holding the watch worker in its
    /// re-subscription loop.
    pub(crate) fn set_head_revision_fails(
        &self,
        fails: bool,
    ) {
        self.state.write().head_revision_fails = fails;
    }

    fn read_defs<D, F>(
        &self,
        names: &[String],
        revision: Revision,
        select: F,
    ) -> Result<Vec<RevisionedDefinition<D>>>
    where
        D: SchemaDefinition,
        F: Fn(&FakeState) -> &HashMap<String, Vec<FakeEntry<D>>>,
    {
        let state = self.state.read();
        if state.reads_disabled {
            return Err(StorageError::Unavailable("reads are disabled".to_string()).into());
        }

        let mut results = Vec::new();
        for name in names {
            let Some(versions) = select(&state).get(name) else {
                continue;
            };
            let newest = versions
                .iter()
                .filter(|entry| entry.last_written.less_or_equal(&revision))
                .max_by_key(|entry| entry.last_written);
            if let Some(entry) = newest {
                if !entry.was_deleted {
                    results.push(RevisionedDefinition {
                        definition: entry.definition.clone().expect("non-deleted entry has a definition"),
                        last_written_revision: entry.last_written,
                    });
                }
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl SchemaDatastore for FakeDatastore {
    fn snapshot_reader(
        &self,
        revision: Revision,
    ) -> Arc<dyn SchemaReader> {
        Arc::new(FakeSnapshotReader {
            store: self.clone(),
            revision,
        })
    }

    async fn head_revision(&self) -> Result<Revision> {
        let state = self.state.read();
        if state.head_revision_fails {
            return Err(StorageError::Unavailable("head revision unavailable".to_string()).into());
        }
        Ok(state.head_revision)
    }

    fn watch_schema(
        &self,
        _from_revision: Revision,
    ) -> SchemaWatch {
        let (schema_tx, states) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let mut state = self.state.write();
        state.schema_tx = Some(schema_tx);
        state.error_tx = Some(error_tx);
        SchemaWatch { states, errors }
    }

    async fn read_write_tx(
        &self,
        _body: TxBody,
    ) -> Result<Revision> {
        Err(StorageError::Unavailable("not implemented".to_string()).into())
    }
}

struct FakeSnapshotReader {
    store: FakeDatastore,
    revision: Revision,
}

#[async_trait]
impl SchemaReader for FakeSnapshotReader {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> Result<(NamespaceDefinition, Revision)> {
        let mut found = self
            .store
            .read_defs(&[name.to_string()], self.revision, |state| &state.namespaces)?;
        match found.pop() {
            Some(entry) => Ok((entry.definition, entry.last_written_revision)),
            None => Err(NamespaceDefinition::not_found(name).into()),
        }
    }

    async fn read_caveat_by_name(
        &self,
        name: &str,
    ) -> Result<(CaveatDefinition, Revision)> {
        let mut found = self
            .store
            .read_defs(&[name.to_string()], self.revision, |state| &state.caveats)?;
        match found.pop() {
            Some(entry) => Ok((entry.definition, entry.last_written_revision)),
            None => Err(CaveatDefinition::not_found(name).into()),
        }
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        self.store.read_defs(names, self.revision, |state| &state.namespaces)
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedDefinition<CaveatDefinition>>> {
        self.store.read_defs(names, self.revision, |state| &state.caveats)
    }
}
