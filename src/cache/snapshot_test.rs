use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use mockall::predicate::eq;
use prost::Message;
use tokio::time::sleep;

use crate::cache::CachingDatastoreProxy;
use crate::config::SnapshotCacheConfig;
use crate::proto::schema::NamespaceDefinition;
use crate::storage::MockSchemaReader;
use crate::storage::MockSchemaTransaction;
use crate::storage::Revision;
use crate::storage::RevisionedDefinition;
use crate::storage::SchemaDatastore;
use crate::storage::SchemaDefinition;
use crate::storage::SchemaReader;
use crate::storage::SchemaTransaction;
use crate::storage::SchemaWatch;
use crate::storage::TxBody;
use crate::test_utils::rev;
use crate::Result;
use crate::StorageError;

const NS_A: &str = "namespace_a";
const NS_B: &str = "namespace_b";

/// Routes each snapshot-reader request to a mock prepared for that revision.
struct StubDatastore {
    readers: HashMap<Revision, Arc<MockSchemaReader>>,
}

#[async_trait]
impl SchemaDatastore for StubDatastore {
    fn snapshot_reader(
        &self,
        revision: Revision,
    ) -> Arc<dyn SchemaReader> {
        let reader = Arc::clone(self.readers.get(&revision).expect("unexpected snapshot revision"));
        reader
    }

    async fn head_revision(&self) -> Result<Revision> {
        unimplemented!("not used by these tests")
    }

    fn watch_schema(
        &self,
        _from_revision: Revision,
    ) -> SchemaWatch {
        unimplemented!("not used by these tests")
    }

    async fn read_write_tx(
        &self,
        _body: TxBody,
    ) -> Result<Revision> {
        unimplemented!("not used by these tests")
    }
}

fn namespace(name: &str) -> NamespaceDefinition {
    NamespaceDefinition::named(name)
}

fn expect_namespace_read(
    reader: &mut MockSchemaReader,
    name: &'static str,
    last_written: Revision,
) {
    reader
        .expect_read_namespace_by_name()
        .with(eq(name))
        .times(1)
        .returning(move |_| Ok((namespace(name), last_written)));
}

#[tokio::test]
async fn test_snapshot_namespace_caching() {
    let old = rev("0.1");
    let zero = rev("0.2");
    let one_written = rev("0.3");
    let one = rev("1");
    let two = rev("2");

    let mut one_reader = MockSchemaReader::new();
    expect_namespace_read(&mut one_reader, NS_A, old);
    expect_namespace_read(&mut one_reader, NS_B, zero);

    let mut two_reader = MockSchemaReader::new();
    expect_namespace_read(&mut two_reader, NS_A, zero);
    expect_namespace_read(&mut two_reader, NS_B, one_written);

    let store = StubDatastore {
        readers: HashMap::from([(one, Arc::new(one_reader)), (two, Arc::new(two_reader))]),
    };
    let proxy = CachingDatastoreProxy::new(Arc::new(store), &SnapshotCacheConfig::default());

    // Each (revision, name) pair is read twice by clients but only once, per
    // the mock `times(1)` expectations, against the backing store.
    for (revision, name, expected) in [
        (one, NS_A, old),
        (one, NS_A, old),
        (one, NS_B, zero),
        (one, NS_B, zero),
        (two, NS_A, zero),
        (two, NS_A, zero),
        (two, NS_B, one_written),
        (two, NS_B, one_written),
    ] {
        let (definition, last_written) = proxy
            .snapshot_reader(revision)
            .read_namespace_by_name(name)
            .await
            .unwrap();
        assert_eq!(definition.name, name);
        assert_eq!(last_written, expected);
    }
}

#[tokio::test]
async fn test_not_found_is_not_cached() {
    let one = rev("1");

    let mut reader = MockSchemaReader::new();
    reader
        .expect_read_namespace_by_name()
        .with(eq(NS_A))
        .times(2)
        .returning(|name| Err(NamespaceDefinition::not_found(name).into()));

    let store = StubDatastore {
        readers: HashMap::from([(one, Arc::new(reader))]),
    };
    let proxy = CachingDatastoreProxy::new(Arc::new(store), &SnapshotCacheConfig::default());

    // Both reads reach the store: negatives are never cached at this layer.
    for _ in 0..2 {
        let error = proxy.snapshot_reader(one).read_namespace_by_name(NS_A).await.unwrap_err();
        assert!(error.is_definition_not_found());
    }
}

#[tokio::test]
async fn test_lookup_serves_cached_names_and_batches_misses() {
    let one = rev("1");

    let mut reader = MockSchemaReader::new();
    reader
        .expect_lookup_namespaces_with_names()
        .withf(|names: &[String]| names == [NS_A.to_string(), NS_B.to_string()])
        .times(1)
        .returning(|_| {
            Ok(vec![
                RevisionedDefinition {
                    definition: namespace(NS_A),
                    last_written_revision: rev("0.1"),
                },
                RevisionedDefinition {
                    definition: namespace(NS_B),
                    last_written_revision: rev("0.2"),
                },
            ])
        });
    reader
        .expect_lookup_namespaces_with_names()
        .withf(|names: &[String]| names == ["namespace_c".to_string()])
        .times(1)
        .returning(|_| Ok(Vec::new()));

    let store = StubDatastore {
        readers: HashMap::from([(one, Arc::new(reader))]),
    };
    let proxy = CachingDatastoreProxy::new(Arc::new(store), &SnapshotCacheConfig::default());

    let names = vec![NS_A.to_string(), NS_B.to_string()];
    let found = proxy.snapshot_reader(one).lookup_namespaces_with_names(&names).await.unwrap();
    assert_eq!(found.len(), 2);

    // A and B are now cached; only the unknown name reaches the store.
    let names = vec![NS_A.to_string(), NS_B.to_string(), "namespace_c".to_string()];
    let found = proxy.snapshot_reader(one).lookup_namespaces_with_names(&names).await.unwrap();
    assert_eq!(found.len(), 2);
}

/// Invokes the transaction body against a single prepared mock transaction
/// and commits at revision 1.
struct TxStubDatastore {
    tx: Arc<MockSchemaTransaction>,
}

#[async_trait]
impl SchemaDatastore for TxStubDatastore {
    fn snapshot_reader(
        &self,
        _revision: Revision,
    ) -> Arc<dyn SchemaReader> {
        unimplemented!("not used by these tests")
    }

    async fn head_revision(&self) -> Result<Revision> {
        unimplemented!("not used by these tests")
    }

    fn watch_schema(
        &self,
        _from_revision: Revision,
    ) -> SchemaWatch {
        unimplemented!("not used by these tests")
    }

    async fn read_write_tx(
        &self,
        body: TxBody,
    ) -> Result<Revision> {
        body(self.tx.as_ref()).await?;
        Ok(rev("1"))
    }
}

#[tokio::test]
async fn test_transaction_local_caching() {
    let zero = rev("0.2");

    let mut tx = MockSchemaTransaction::new();
    // The mock panics if the transactional reader sees a second read.
    tx.expect_read_namespace_by_name()
        .with(eq(NS_A))
        .times(1)
        .returning(move |_| Ok((namespace(NS_A), zero)));

    let store = TxStubDatastore { tx: Arc::new(tx) };
    let proxy = CachingDatastoreProxy::new(Arc::new(store), &SnapshotCacheConfig::default());

    let commit = proxy
        .read_write_tx(Box::new(move |tx: &dyn SchemaTransaction| {
            async move {
                let (_, first) = tx.read_namespace_by_name(NS_A).await?;
                assert_eq!(first, zero);

                let (_, second) = tx.read_namespace_by_name(NS_A).await?;
                assert_eq!(second, zero);

                Ok(())
            }
            .boxed()
        }))
        .await
        .unwrap();

    assert_eq!(commit, rev("1"));
}

#[tokio::test]
async fn test_transaction_write_invalidates_memoized_read() {
    let before = rev("0.1");
    let after = rev("0.9");

    let mut tx = MockSchemaTransaction::new();
    let mut reads = mockall::Sequence::new();
    tx.expect_read_namespace_by_name()
        .with(eq(NS_A))
        .times(1)
        .in_sequence(&mut reads)
        .returning(move |_| Ok((namespace(NS_A), before)));
    tx.expect_write_namespaces().times(1).returning(|_| Ok(()));
    tx.expect_read_namespace_by_name()
        .with(eq(NS_A))
        .times(1)
        .in_sequence(&mut reads)
        .returning(move |_| Ok((namespace(NS_A), after)));

    let store = TxStubDatastore { tx: Arc::new(tx) };
    let proxy = CachingDatastoreProxy::new(Arc::new(store), &SnapshotCacheConfig::default());

    proxy
        .read_write_tx(Box::new(move |tx: &dyn SchemaTransaction| {
            async move {
                let (_, first) = tx.read_namespace_by_name(NS_A).await?;
                assert_eq!(first, before);

                tx.write_namespaces(vec![namespace(NS_A)]).await?;

                // The write dropped the memoized outcome; this read reaches
                // the transactional reader and observes the new revision.
                let (_, second) = tx.read_namespace_by_name(NS_A).await?;
                assert_eq!(second, after);

                Ok(())
            }
            .boxed()
        }))
        .await
        .unwrap();
}

/// Counts backing reads and delays each one, so concurrent readers overlap.
struct SlowDatastore {
    reads: Arc<AtomicUsize>,
}

struct SlowReader {
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl SchemaReader for SlowReader {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> Result<(NamespaceDefinition, Revision)> {
        sleep(Duration::from_millis(10)).await;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok((namespace(name), rev("0.1")))
    }

    async fn read_caveat_by_name(
        &self,
        _name: &str,
    ) -> Result<(crate::proto::schema::CaveatDefinition, Revision)> {
        unimplemented!("not used by these tests")
    }

    async fn lookup_namespaces_with_names(
        &self,
        _names: &[String],
    ) -> Result<Vec<RevisionedDefinition<NamespaceDefinition>>> {
        unimplemented!("not used by these tests")
    }

    async fn lookup_caveats_with_names(
        &self,
        _names: &[String],
    ) -> Result<Vec<RevisionedDefinition<crate::proto::schema::CaveatDefinition>>> {
        unimplemented!("not used by these tests")
    }
}

#[async_trait]
impl SchemaDatastore for SlowDatastore {
    fn snapshot_reader(
        &self,
        _revision: Revision,
    ) -> Arc<dyn SchemaReader> {
        Arc::new(SlowReader {
            reads: Arc::clone(&self.reads),
        })
    }

    async fn head_revision(&self) -> Result<Revision> {
        unimplemented!("not used by these tests")
    }

    fn watch_schema(
        &self,
        _from_revision: Revision,
    ) -> SchemaWatch {
        unimplemented!("not used by these tests")
    }

    async fn read_write_tx(
        &self,
        _body: TxBody,
    ) -> Result<Revision> {
        unimplemented!("not used by these tests")
    }
}

#[tokio::test]
async fn test_concurrent_misses_coalesce_to_one_backing_read() {
    let reads = Arc::new(AtomicUsize::new(0));
    let store = SlowDatastore {
        reads: Arc::clone(&reads),
    };
    let proxy = CachingDatastoreProxy::new(Arc::new(store), &SnapshotCacheConfig::default());

    let read = || async {
        proxy
            .snapshot_reader(rev("1"))
            .read_namespace_by_name(NS_A)
            .await
    };

    let (first, second) = tokio::join!(read(), read());

    let (first_def, first_rev) = first.unwrap();
    let (second_def, second_rev) = second.unwrap();
    assert_eq!(first_def, second_def);
    assert_eq!(first_rev, second_rev);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_absent_definition_round_trips_through_encoding() {
    // An absent definition encodes to the empty message and decodes back to
    // the same absent value without error.
    let absent = NamespaceDefinition::default();
    let encoded = absent.encode_to_vec();
    assert!(encoded.is_empty());

    let decoded = NamespaceDefinition::decode(encoded.as_slice()).unwrap();
    assert_eq!(absent, decoded);
    assert_eq!(absent.serialized(), decoded.serialized());
}

#[tokio::test]
async fn test_unavailable_errors_are_not_cached() {
    let one = rev("1");

    let mut reader = MockSchemaReader::new();
    let mut attempts = mockall::Sequence::new();
    reader
        .expect_read_namespace_by_name()
        .with(eq(NS_A))
        .times(1)
        .in_sequence(&mut attempts)
        .returning(|_| Err(StorageError::Unavailable("store down".to_string()).into()));
    reader
        .expect_read_namespace_by_name()
        .with(eq(NS_A))
        .times(1)
        .in_sequence(&mut attempts)
        .returning(|_| Ok((namespace(NS_A), rev("0.1"))));

    let store = StubDatastore {
        readers: HashMap::from([(one, Arc::new(reader))]),
    };
    let proxy = CachingDatastoreProxy::new(Arc::new(store), &SnapshotCacheConfig::default());

    let error = proxy.snapshot_reader(one).read_namespace_by_name(NS_A).await.unwrap_err();
    assert!(matches!(error, crate::Error::Storage(StorageError::Unavailable(_))));

    // The failure was not cached; the retry succeeds against the store.
    let (definition, _) = proxy.snapshot_reader(one).read_namespace_by_name(NS_A).await.unwrap();
    assert_eq!(definition.name, NS_A);
}
