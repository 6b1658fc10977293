//! External storage collaborators (spec §6): document blob storage, the
//! connection/transaction factory, and the two ad-hoc SQL reads the session
//! issues directly (`select * from documents where id = @id` and the
//! per-descriptor reduced-row lookup).
//!
//! Two implementations ship: [`sql`] is the real `sqlx::Any`-backed one
//! used against SQLite/Postgres, and [`memory`] is an in-process
//! implementation for unit tests, mirroring the teacher's shipped-engine /
//! mock-engine split.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use sqlx::{Any, Transaction};

use crate::document::Document;
use crate::error::Result;
use crate::types::{DocumentId, IsolationLevel};

/// Document (blob) storage collaborator (spec §6).
///
/// Entities are opaque to this trait: they are read and written as
/// canonical `serde_json::Value` blobs. The session is responsible for
/// serializing/deserializing against the caller's concrete entity type.
///
/// Every method runs against the session's own open transaction, passed in
/// by the caller, rather than a separate pooled connection: document
/// writes must commit or roll back atomically with the index commands the
/// same commit produces (spec §4.5, §8 "cancellation atomicity").
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Loads the entity blob for `id`, or `None` if no document exists
    /// under that id.
    async fn load(&self, tx: &mut Transaction<'_, Any>, id: DocumentId) -> Result<Option<serde_json::Value>>;

    /// Bulk-loads entity blobs for `ids`, positionally: result\[i\]
    /// corresponds to `ids[i]`, `None` where no document exists.
    async fn load_many(
        &self,
        tx: &mut Transaction<'_, Any>,
        ids: &[DocumentId],
    ) -> Result<Vec<Option<serde_json::Value>>>;

    /// Persists (inserts or overwrites) the entity blob for `id`.
    async fn save(&self, tx: &mut Transaction<'_, Any>, id: DocumentId, value: serde_json::Value) -> Result<()>;

    /// Deletes the entity blob for `id`, if present.
    async fn delete(&self, tx: &mut Transaction<'_, Any>, id: DocumentId) -> Result<()>;
}

/// Reads the current `Document` header row for `id`
/// (`select * from documents where id = @id`, spec §6).
#[async_trait]
pub trait DocumentRowStore: Send + Sync {
    /// Returns the `Document` header row for `id`, if one exists.
    async fn find_document(&self, tx: &mut Transaction<'_, Any>, id: DocumentId) -> Result<Option<Document>>;

    /// Inserts a new `Document` header row, returning the assigned id.
    /// Executes inline at the moment a new entity is first encountered
    /// (spec §4.3 item 1), never queued on the journal, but against the
    /// same open transaction as everything else in the commit, so a
    /// canceled session rolls the insert back too.
    async fn create_document(&self, tx: &mut Transaction<'_, Any>, type_name: &str) -> Result<Document>;
}

/// Reads the current persisted reduced row for one descriptor/group-key
/// pair (`select * from <IndexTypeName> where <GroupKeyColumnName> =
/// @currentKey`, spec §6, §4.4 step c).
#[async_trait]
pub trait ReduceIndexQuery: Send + Sync {
    /// Returns the persisted row's `(id, fields)` for `index_type` and
    /// `group_key`, if one exists.
    async fn find_reduced(
        &self,
        tx: &mut Transaction<'_, Any>,
        index_type: &str,
        group_key: &serde_json::Value,
    ) -> Result<Option<(DocumentId, serde_json::Value)>>;
}

/// Supplies connections and opens transactions at a chosen isolation level
/// (spec §6 "Connection factory").
///
/// A transaction is inherently a SQL-backend concept in this spec (the
/// in-memory collaborators in [`memory`] cover document/index storage only,
/// not transactions: `Session` requires a real `ConnectionFactory` to do
/// any work that touches the journal).
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a connection (if needed) and begins a transaction at `level`
    /// (spec §4.1 "Opening steps"). The concrete SQL statement used to
    /// request the isolation level, if any, is this factory's concern;
    /// the session only ever sees the resulting transaction handle.
    async fn begin(&self, level: IsolationLevel) -> Result<Transaction<'static, Any>>;

    /// Whether connections produced by this factory should be explicitly
    /// disposed by the session, or are left open (e.g. pooled) (spec §4.1
    /// `dispose`, §5 "Shared resources").
    fn disposable(&self) -> bool;
}
