//! The session orchestrator: the public surface of the engine (spec §4.1).
//!
//! `Session` owns the transaction lifecycle and coordinates the identity
//! map, change tracker, map/reduce pipeline, and command journal to turn
//! `save`/`delete` calls into an ordered sequence of index commands
//! executed inside one transaction.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::{Any as AnyDb, Transaction};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::SessionConfig;
use crate::descriptor::DescriptorRegistry;
use crate::document::{cell_identity, Document, Entity, EntityHandle, TypedHandle};
use crate::error::{Result, SessionError, StorageError};
use crate::identity_map::IdentityMap;
use crate::journal::{DeleteDocumentCommand, Journal};
use crate::mapreduce::MapReducePipeline;
use crate::storage::{ConnectionFactory, DocumentRowStore, DocumentStore, ReduceIndexQuery};
use crate::tracker::{decide, ChangeTracker, Decision};
use crate::types::{DocumentId, IsolationLevel};

/// The collaborators a `Session` is built from (spec §6 "External
/// interfaces"). Grouped into one struct so construction reads as a
/// single dependency list, the way the teacher's `PulseDB::open` takes
/// one `Config` rather than a long parameter list.
pub struct SessionDeps {
    /// Document (blob) storage collaborator.
    pub document_store: Arc<dyn DocumentStore>,
    /// `Document` header row collaborator.
    pub document_rows: Arc<dyn DocumentRowStore>,
    /// Persisted reduced-row lookup collaborator.
    pub reduce_query: Arc<dyn ReduceIndexQuery>,
    /// Connection/transaction provider.
    pub connection_factory: Arc<dyn ConnectionFactory>,
    /// Index descriptor registry.
    pub descriptor_registry: Arc<dyn DescriptorRegistry>,
}

/// A bound handle returned by [`Session::query`], letting the caller's
/// query-builder collaborator (out of scope for this crate, spec §1) run
/// against the same connection/transaction the session is using, after
/// pending work has been flushed into it.
pub struct QueryHandle<'a> {
    tx: &'a mut Transaction<'static, AnyDb>,
}

impl<'a> QueryHandle<'a> {
    /// Returns the live transaction backing this session, for use by an
    /// external query builder.
    pub fn transaction(&mut self) -> &mut Transaction<'static, AnyDb> {
        self.tx
    }
}

/// The unit-of-work session (spec §4.1).
///
/// Not safe for concurrent use, owned by exactly one logical task at a
/// time (spec §5). All public operations are `async`; the only points
/// where control yields are the underlying storage/SQL awaits.
pub struct Session {
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    mapreduce: MapReducePipeline,
    journal: Journal,
    config: SessionConfig,
    document_store: Arc<dyn DocumentStore>,
    document_rows: Arc<dyn DocumentRowStore>,
    reduce_query: Arc<dyn ReduceIndexQuery>,
    connection_factory: Arc<dyn ConnectionFactory>,
    descriptor_registry: Arc<dyn DescriptorRegistry>,
    transaction: Option<Transaction<'static, AnyDb>>,
    canceled: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tracked_entities", &self.identity_map.len())
            .field("pending_saves", &self.tracker.pending_save_count())
            .field("pending_deletes", &self.tracker.pending_delete_count())
            .field("journal_len", &self.journal.len())
            .field("transaction_open", &self.transaction.is_some())
            .field("canceled", &self.canceled)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a new session over the given collaborators, with the
    /// given initial isolation level. The transaction is not opened yet;
    /// it is lazily opened on first demand (spec §4.1).
    pub fn new(deps: SessionDeps, config: SessionConfig) -> Self {
        Self {
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            mapreduce: MapReducePipeline::new(),
            journal: Journal::new(),
            config,
            document_store: deps.document_store,
            document_rows: deps.document_rows,
            reduce_query: deps.reduce_query,
            connection_factory: deps.connection_factory,
            descriptor_registry: deps.descriptor_registry,
            transaction: None,
            canceled: false,
        }
    }

    /// Sets the isolation level the session's transaction will be opened
    /// at. Permitted only before the transaction is opened, once a
    /// transaction exists, the request is rejected rather than silently
    /// ignored (spec §4.1, §9 open question).
    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        if self.transaction.is_some() {
            return Err(SessionError::invalid_operation(
                "isolation level cannot change after the session's transaction has been opened",
            ));
        }
        self.config.isolation_level = level;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ensure_transaction(&mut self) -> Result<()> {
        if self.transaction.is_none() {
            let tx = self
                .connection_factory
                .begin(self.config.isolation_level)
                .await?;
            self.transaction = Some(tx);
        }
        Ok(())
    }

    /// Records `entity` in the pending-save set.
    ///
    /// If `entity` is already tracked in this session's identity map
    /// (previously `get`/`save`d), this is a no-op: it will be
    /// reconsidered via structural diffing at commit time (spec §4.1).
    ///
    /// The spec rejects saving a `Document` or `Index` object at the
    /// call site; this crate enforces that at compile time instead via
    /// the `T: Entity` bound: `Document` and index row types never
    /// implement [`Entity`](crate::document::Entity), so such a call
    /// would simply fail to type-check.
    #[instrument(skip(self, entity))]
    pub async fn save<T: Entity>(&mut self, entity: Arc<Mutex<T>>) -> Result<()> {
        let identity = cell_identity(&entity);
        if self.identity_map.id_for_identity(identity).is_some() {
            return Ok(());
        }
        let handle: Arc<dyn EntityHandle> = Arc::new(TypedHandle::new(entity));
        self.tracker.queue_save(identity, handle);
        Ok(())
    }

    /// Records `entity` in the pending-delete set.
    ///
    /// The entity must expose an assigned id by the time `commit` runs;
    /// otherwise the commit fails with
    /// [`SessionError::InvalidOperation`] (spec §4.3 item 3, §7).
    #[instrument(skip(self, entity))]
    pub async fn delete<T: Entity>(&mut self, entity: Arc<Mutex<T>>) -> Result<()> {
        let handle: Arc<dyn EntityHandle> = Arc::new(TypedHandle::new(entity));
        self.tracker.queue_delete(handle);
        Ok(())
    }

    /// Returns the entities for `ids`, positionally: result\[i\]
    /// corresponds to `ids[i]`, `None` where no document exists under
    /// that id. Entities already tracked in the identity map are
    /// returned as the same shared instance; the rest are bulk-loaded
    /// from document storage (spec §4.1, §4.2 invariant 4).
    #[instrument(skip(self))]
    pub async fn get<T: Entity>(&mut self, ids: &[DocumentId]) -> Result<Vec<Option<Arc<Mutex<T>>>>> {
        self.ensure_transaction().await?;

        let mut missing = Vec::new();
        for &id in ids {
            if self.identity_map.get(id).is_none() && !missing.contains(&id) {
                missing.push(id);
            }
        }

        if !missing.is_empty() {
            let mut tx = self
                .transaction
                .take()
                .expect("ensure_transaction opened the transaction above");
            let result = self.document_store.load_many(&mut tx, &missing).await;
            self.transaction = Some(tx);
            let blobs = result?;
            for (id, blob) in missing.into_iter().zip(blobs) {
                if let Some(blob) = blob {
                    let mut value: T = serde_json::from_value(blob)?;
                    value.set_id(id);
                    let cell = Arc::new(Mutex::new(value));
                    let identity = cell_identity(&cell);
                    let handle: Arc<dyn EntityHandle> = Arc::new(TypedHandle::new(cell));
                    self.identity_map.insert(id, identity, handle);
                }
            }
        }

        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.identity_map.get(id) {
                Some(handle) => {
                    let typed = handle.as_any().downcast_ref::<TypedHandle<T>>().ok_or_else(|| {
                        SessionError::invalid_argument(format!(
                            "document {id} is tracked under a different entity type"
                        ))
                    })?;
                    out.push(Some(typed.cell()));
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    /// Auto-flushes pending work into the still-open transaction, then
    /// returns a handle bound to it for an external query builder (spec
    /// §4.1, §9 "Auto-flush in query() is a required behavior, not an
    /// optimization").
    #[instrument(skip(self))]
    pub async fn query(&mut self) -> Result<QueryHandle<'_>> {
        self.commit().await?;
        let tx = self
            .transaction
            .as_mut()
            .expect("commit() opens the transaction before returning");
        Ok(QueryHandle { tx })
    }

    /// Flushes all pending work into the session's transaction: resolves
    /// tracked entities (diffed), then explicit saves, then explicit
    /// deletes, then map/reduce finalization, then drains the journal
    /// (spec §4.3 commit order, §5 ordering guarantees).
    ///
    /// Does not commit or roll back the underlying database transaction;
    /// that is [`Session::dispose`]'s responsibility. Calling `commit`
    /// again after a successful commit is a well-defined no-op (nothing
    /// is pending).
    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_transaction().await?;
        let mut tx = self
            .transaction
            .take()
            .expect("ensure_transaction opened the transaction above");

        let result = self.commit_with_tx(&mut tx).await;
        self.transaction = Some(tx);
        result
    }

    /// The body of [`commit`](Self::commit), run against a transaction the
    /// caller owns locally rather than one borrowed from `self`: document
    /// store, document row, and index-command writes all share this one
    /// transaction, so a subsequent rollback undoes every one of them
    /// (spec §8 "cancellation atomicity").
    async fn commit_with_tx(&mut self, tx: &mut Transaction<'static, AnyDb>) -> Result<()> {
        let deletes = self.tracker.take_deletes();
        let mut delete_ids: HashSet<DocumentId> = HashSet::new();
        for handle in &deletes {
            if let Some(id) = handle.document_id().await {
                delete_ids.insert(id);
            }
        }

        let tracked: Vec<(DocumentId, Arc<dyn EntityHandle>)> = self
            .identity_map
            .iter()
            .map(|(id, handle)| (id, Arc::clone(handle)))
            .collect();
        for (id, handle) in tracked {
            if delete_ids.contains(&id) {
                continue;
            }
            self.resolve_existing(id, handle, tx).await?;
        }

        let saves = self.tracker.take_saves();
        for (identity, handle) in saves {
            self.resolve_new(identity, handle, tx).await?;
        }

        for handle in deletes {
            self.resolve_delete(handle, tx).await?;
        }

        let descriptors = self.descriptor_registry.all_descriptors();
        self.mapreduce
            .finalize(&descriptors, self.reduce_query.as_ref(), tx, &mut self.journal)
            .await?;

        self.journal.drain(tx).await?;

        Ok(())
    }

    /// New-entity path (spec §4.3 item 1): create the `Document` row
    /// inline (not via the journal: the assigned id is needed
    /// immediately), persist the blob, register the entity in the
    /// identity map, then run `map_new`.
    #[instrument(skip(self, handle, tx))]
    async fn resolve_new(
        &mut self,
        identity: usize,
        handle: Arc<dyn EntityHandle>,
        tx: &mut Transaction<'static, AnyDb>,
    ) -> Result<()> {
        let type_name = handle.type_name();
        let doc = self.document_rows.create_document(tx, type_name).await?;
        handle.set_document_id(doc.id).await;

        let blob = handle.snapshot().await;
        self.document_store.save(tx, doc.id, blob).await?;
        self.identity_map.insert(doc.id, identity, Arc::clone(&handle));

        let value = handle.value().await;
        let descriptors = self.descriptor_registry.descriptors_for(type_name);
        self.mapreduce.map_new(&doc, value.as_ref(), &descriptors, &mut self.journal);

        info!(document_id = doc.id, type_name, "created document");
        Ok(())
    }

    /// Tracked-entity path (spec §4.3 item 2): compare the persisted
    /// blob against the entity's current state; if unchanged, do
    /// nothing; otherwise re-map (delete the old projection, emit the
    /// new one) and re-persist.
    #[instrument(skip(self, handle, tx))]
    async fn resolve_existing(
        &mut self,
        id: DocumentId,
        handle: Arc<dyn EntityHandle>,
        tx: &mut Transaction<'static, AnyDb>,
    ) -> Result<()> {
        let Some(old_blob) = self.document_store.load(tx, id).await? else {
            warn!(document_id = id, "tracked entity has no stored blob, skipping diff");
            return Ok(());
        };
        let new_blob = handle.snapshot().await;

        if decide(&old_blob, &new_blob) == Decision::Unchanged {
            return Ok(());
        }

        let doc = self.document_rows.find_document(tx, id).await?.ok_or_else(|| {
            SessionError::invalid_operation(format!("document {id} has no Document row"))
        })?;

        let type_name = handle.type_name();
        let descriptors = self.descriptor_registry.descriptors_for(type_name);

        let old_value = handle.deserialize_snapshot(&old_blob).await?;
        self.mapreduce.map_deleted(&doc, old_value.as_ref(), &descriptors, &mut self.journal);

        let new_value = handle.value().await;
        self.mapreduce.map_new(&doc, new_value.as_ref(), &descriptors, &mut self.journal);

        self.document_store.save(tx, id, new_blob).await?;
        Ok(())
    }

    /// Delete path (spec §4.3 item 3): resolve the id, remove the
    /// `Document` row and blob, queue `DeleteDocumentCommand`, drop the
    /// entity from the identity map, and run `map_deleted`.
    #[instrument(skip(self, handle, tx))]
    async fn resolve_delete(
        &mut self,
        handle: Arc<dyn EntityHandle>,
        tx: &mut Transaction<'static, AnyDb>,
    ) -> Result<()> {
        let id = handle.document_id().await.ok_or_else(|| {
            SessionError::invalid_operation("cannot delete an entity with no assigned id")
        })?;

        let doc = self.document_rows.find_document(tx, id).await?;
        let Some(doc) = doc else {
            return Ok(());
        };

        self.document_store.delete(tx, id).await?;
        self.journal.push(Box::new(DeleteDocumentCommand { document: doc.clone() }));
        self.identity_map.remove(id);

        let type_name = handle.type_name();
        let descriptors = self.descriptor_registry.descriptors_for(type_name);
        let value = handle.value().await;
        self.mapreduce.map_deleted(&doc, value.as_ref(), &descriptors, &mut self.journal);

        info!(document_id = id, "deleted document");
        Ok(())
    }

    /// Marks this session for rollback: `dispose` will roll back the
    /// transaction instead of committing it. Idempotent; does not abort
    /// any in-flight operation (spec §5 "Cancellation").
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    /// Finalizes the session: if not canceled, runs [`commit`](Self::commit)
    /// then commits the underlying transaction; otherwise rolls back.
    /// Always disposes the transaction. Consumes `self`, mirroring the
    /// teacher's `PulseDB::close` ownership-based lifecycle.
    ///
    /// Per spec §7: on a backend error raised during a prior `commit`,
    /// the caller should `cancel` before calling `dispose`, since a
    /// non-canceled `dispose` will attempt to commit again and will
    /// likely re-fail against the same broken state.
    #[instrument(skip(self))]
    pub async fn dispose(mut self) -> Result<()> {
        if self.canceled {
            if let Some(tx) = self.transaction.take() {
                tx.rollback()
                    .await
                    .map_err(|e| StorageError::transaction(e.to_string()))?;
                info!("session canceled, transaction rolled back");
            }
            return Ok(());
        }

        self.commit().await?;
        if let Some(tx) = self.transaction.take() {
            tx.commit()
                .await
                .map_err(|e| StorageError::transaction(e.to_string()))?;
            info!("session committed");
        }

        // `sqlx` transactions return their connection to the pool on
        // commit/rollback; `connection_factory.disposable()` only matters
        // for a caller managing a dedicated, non-pooled connection outside
        // the transaction itself, which this crate's shipped factories do
        // not do (spec §5 "Shared resources").
        let _ = self.connection_factory.disposable();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{IndexDescriptor, IndexRow, InMemoryDescriptorRegistry, TypedDescriptor};
    use crate::document::{HasId, TypeName};
    use crate::storage::memory::MemoryStore;
    use crate::storage::sql::SqlReduceIndexQuery;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use sqlx::any::AnyPoolOptions;

    #[derive(Clone, Debug, Serialize, Deserialize, Default)]
    struct Person {
        id: Option<DocumentId>,
        name: String,
    }

    impl HasId for Person {
        fn id(&self) -> Option<DocumentId> {
            self.id
        }
        fn set_id(&mut self, id: DocumentId) {
            self.id = Some(id);
        }
    }

    impl TypeName for Person {
        fn simple_type_name() -> &'static str {
            "Person"
        }
    }

    /// A `ConnectionFactory` and document/index collaborator bundle
    /// backed by a real in-memory SQLite database, so `Session`'s full
    /// commit pipeline (which requires a genuine transaction) can be
    /// exercised without any external services.
    struct TestHarness {
        pool: sqlx::Pool<sqlx::Any>,
    }

    #[async_trait::async_trait]
    impl ConnectionFactory for TestHarness {
        async fn begin(&self, _level: IsolationLevel) -> Result<Transaction<'static, AnyDb>> {
            self.pool
                .begin()
                .await
                .map_err(|e| StorageError::connection(e.to_string()).into())
        }

        fn disposable(&self) -> bool {
            false
        }
    }

    async fn test_pool() -> sqlx::Pool<sqlx::Any> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "create table documents (id integer primary key autoincrement, type_name text not null, payload text not null)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "create table PersonByName (id integer primary key autoincrement, group_key text, fields text not null, documents text not null)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn person_by_name_descriptor() -> Arc<dyn IndexDescriptor> {
        Arc::new(
            TypedDescriptor::map_reduce(
                "PersonByName",
                "name",
                |p: &Person| {
                    vec![IndexRow::new("PersonByName", json!({"count": 1}))
                        .with_group_key(json!(p.name))]
                },
                |key, rows| {
                    let sum: i64 = rows.iter().map(|r| r.fields["count"].as_i64().unwrap_or(0)).sum();
                    Some(json!({"name": key, "count": sum}))
                },
            )
            .with_delete(|current, deleted| {
                let remaining = current["count"].as_i64().unwrap_or(0)
                    - deleted.iter().map(|r| r.fields["count"].as_i64().unwrap_or(0)).sum::<i64>();
                if remaining <= 0 {
                    None
                } else {
                    Some(json!({"count": remaining}))
                }
            }),
        )
    }

    async fn new_session(pool: sqlx::Pool<sqlx::Any>) -> Session {
        let mut registry = InMemoryDescriptorRegistry::new();
        registry.register("Person", person_by_name_descriptor());

        let store = Arc::new(MemoryStore::new());
        // Document row + blob storage go through `MemoryStore` for these
        // unit tests so assertions can use its in-process accessors; the
        // reduce-index read has to go through the real `PersonByName` table
        // instead, since that is the table the journal's index commands
        // actually write to, mirroring the split in `storage::sql` vs
        // `storage::memory`.
        let deps = SessionDeps {
            document_store: store.clone(),
            document_rows: store.clone(),
            reduce_query: Arc::new(SqlReduceIndexQuery::new()),
            connection_factory: Arc::new(TestHarness { pool }),
            descriptor_registry: Arc::new(registry),
        };
        Session::new(deps, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_save_commit_assigns_id_and_roundtrips() {
        let pool = test_pool().await;
        let mut session = new_session(pool).await;

        let person = Arc::new(Mutex::new(Person {
            id: None,
            name: "Ada".into(),
        }));
        session.save(Arc::clone(&person)).await.unwrap();
        session.commit().await.unwrap();

        let id = person.lock().await.id;
        assert!(id.is_some());

        let fetched = session.get::<Person>(&[id.unwrap()]).await.unwrap();
        assert!(Arc::ptr_eq(fetched[0].as_ref().unwrap(), &person));
    }

    #[tokio::test]
    async fn test_resave_tracked_entity_is_noop_until_commit() {
        let pool = test_pool().await;
        let mut session = new_session(pool).await;

        let person = Arc::new(Mutex::new(Person {
            id: None,
            name: "Ada".into(),
        }));
        session.save(Arc::clone(&person)).await.unwrap();
        session.save(Arc::clone(&person)).await.unwrap();
        session.commit().await.unwrap();

        // Re-saving the now-tracked entity is a no-op; a second commit
        // with no changes produces no further document/index writes.
        session.save(Arc::clone(&person)).await.unwrap();
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_then_dispose_rolls_back() {
        let pool = test_pool().await;
        let mut session = new_session(pool).await;

        let person = Arc::new(Mutex::new(Person {
            id: None,
            name: "Ada".into(),
        }));
        session.save(Arc::clone(&person)).await.unwrap();
        session.commit().await.unwrap();
        session.cancel();
        session.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_without_id_fails() {
        let pool = test_pool().await;
        let mut session = new_session(pool).await;

        let person = Arc::new(Mutex::new(Person {
            id: None,
            name: "Nobody".into(),
        }));
        session.delete(person).await.unwrap();
        let result = session.commit().await;
        assert!(result.unwrap_err().is_invalid_operation());
    }

    #[tokio::test]
    async fn test_set_isolation_level_rejected_after_transaction_open() {
        let pool = test_pool().await;
        let mut session = new_session(pool).await;
        session.ensure_transaction().await.unwrap();

        let err = session
            .set_isolation_level(IsolationLevel::ReadCommitted)
            .unwrap_err();
        assert!(err.is_invalid_operation());
    }
}
