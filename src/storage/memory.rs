//! In-process implementations of the document/row storage collaborators,
//! used by unit tests (identity map, change tracker, map/reduce folding)
//! that don't need a real SQL backend, mirroring the teacher's documented
//! (if unbuilt) `MockStorage` companion to `RedbStorage`.
//!
//! The journal always emits `storage::sql`'s `IndexCommand`s, which write
//! index tables through the session's real `sqlx` transaction regardless of
//! which `DocumentStore`/`DocumentRowStore` backs entity storage, so this
//! module covers only those two collaborators. Reduce-index reads
//! (`ReduceIndexQuery`) must go through `storage::sql::SqlReduceIndexQuery`
//! against that same table for the same reason: there is no in-memory
//! index state for a `MemoryStore`-only view to answer from.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{Any, Transaction};

use crate::document::Document;
use crate::error::Result;
use crate::types::DocumentId;

use super::{DocumentRowStore, DocumentStore};

#[derive(Default)]
struct MemoryState {
    documents: HashMap<DocumentId, Document>,
    payloads: HashMap<DocumentId, serde_json::Value>,
    next_id: DocumentId,
}

/// A single in-process store shared by a `DocumentStore` and a
/// `DocumentRowStore` view.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_document_id(&self) -> DocumentId {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        state.next_id += 1;
        state.next_id
    }
}

// `MemoryStore` keeps its own in-process state rather than the session's SQL
// transaction, so every trait method below takes (and ignores) the `tx`
// parameter the object-safe traits require to stay usable against a real
// `sqlx::Any` transaction too. That means a `MemoryStore`-backed collaborator
// does *not* get transactional rollback on `Session::cancel`. Acceptable for
// unit tests exercising the identity map / change tracker / map-reduce
// folding in isolation, not for the shipped `storage::sql` stack.
#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, _tx: &mut Transaction<'_, Any>, id: DocumentId) -> Result<Option<serde_json::Value>> {
        Ok(self
            .state
            .lock()
            .expect("memory store mutex poisoned")
            .payloads
            .get(&id)
            .cloned())
    }

    async fn load_many(
        &self,
        _tx: &mut Transaction<'_, Any>,
        ids: &[DocumentId],
    ) -> Result<Vec<Option<serde_json::Value>>> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        Ok(ids.iter().map(|id| state.payloads.get(id).cloned()).collect())
    }

    async fn save(&self, _tx: &mut Transaction<'_, Any>, id: DocumentId, value: serde_json::Value) -> Result<()> {
        self.state
            .lock()
            .expect("memory store mutex poisoned")
            .payloads
            .insert(id, value);
        Ok(())
    }

    async fn delete(&self, _tx: &mut Transaction<'_, Any>, id: DocumentId) -> Result<()> {
        self.state
            .lock()
            .expect("memory store mutex poisoned")
            .payloads
            .remove(&id);
        Ok(())
    }
}

#[async_trait]
impl DocumentRowStore for MemoryStore {
    async fn find_document(&self, _tx: &mut Transaction<'_, Any>, id: DocumentId) -> Result<Option<Document>> {
        Ok(self
            .state
            .lock()
            .expect("memory store mutex poisoned")
            .documents
            .get(&id)
            .cloned())
    }

    async fn create_document(&self, _tx: &mut Transaction<'_, Any>, type_name: &str) -> Result<Document> {
        let id = self.next_document_id();
        let document = Document::new(id, type_name);
        self.state
            .lock()
            .expect("memory store mutex poisoned")
            .documents
            .insert(id, document.clone());
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// `MemoryStore`'s trait methods ignore their `tx` argument, but a real
    /// one is still needed to call them: a throwaway in-memory SQLite
    /// transaction is the cheapest way to get a `Transaction<'_, Any>` value
    /// in a unit test.
    async fn test_tx() -> Transaction<'static, Any> {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        pool.begin().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_load_document() {
        let store = MemoryStore::new();
        let mut tx = test_tx().await;
        let doc = store.create_document(&mut tx, "Person").await.unwrap();
        store.save(&mut tx, doc.id, json!({"name": "Ada"})).await.unwrap();

        let loaded = store.load(&mut tx, doc.id).await.unwrap();
        assert_eq!(loaded, Some(json!({"name": "Ada"})));

        let row = store.find_document(&mut tx, doc.id).await.unwrap().unwrap();
        assert_eq!(row.type_name.as_str(), "Person");
    }
}
