//! Documents, entity trait bounds, and the type-erasure plumbing that lets
//! the identity map, change tracker, and map/reduce pipeline hold
//! heterogeneous entity types behind one object-safe handle.
//!
//! The spec models an "Id accessor registry" that reflects a `get`/`set`
//! pair for an entity type's `Id` property (spec §6). Rust has no runtime
//! reflection, so this is translated into the idiomatic equivalent: a
//! [`HasId`] trait bound that every persisted entity type must implement.
//! The spec's "accessor may be absent" case becomes `HasId::id()` returning
//! `None` for an entity that has never been assigned one, which still lets
//! `delete` raise the same `InvalidOperation` the spec calls for.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::types::{DocumentId, SimpleTypeName};

/// The persistence-layer header row that anchors a serialized entity blob
/// (spec §3). The document row itself owns no payload: the entity lives
/// in document storage keyed by `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Unique, monotonic identifier assigned by the backing store.
    pub id: DocumentId,
    /// Simplified (assembly-independent) name of the entity's runtime type.
    pub type_name: SimpleTypeName,
}

impl Document {
    /// Creates a new document header.
    pub fn new(id: DocumentId, type_name: impl Into<SimpleTypeName>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
        }
    }
}

/// A runtime-reported simplified type name for an entity type.
///
/// Implemented by every persisted entity type (typically via a derive or a
/// one-line manual impl); used to look up index descriptors and to stamp
/// the `Document.type_name` column.
pub trait TypeName {
    /// The simplified (assembly-independent) type name for this entity.
    fn simple_type_name() -> &'static str;
}

/// An entity that exposes an integer id the session can read and write.
///
/// `id()` returns `None` until the session has assigned one (on first
/// insert). A `delete()` call on an entity whose `id()` is `None` fails
/// with [`SessionError::InvalidOperation`](crate::error::SessionError)
/// per spec §4.3 item 3.
pub trait HasId {
    /// Returns the entity's assigned id, or `None` if it has never been
    /// persisted.
    fn id(&self) -> Option<DocumentId>;

    /// Assigns the entity's id. Called once, immediately after the
    /// session inserts a new `Document` row for this entity.
    fn set_id(&mut self, id: DocumentId);
}

/// The full set of bounds a type must satisfy to be saved, loaded, or
/// deleted through a [`Session`](crate::session::Session).
///
/// Entities cannot be `Document` or any `Index` type; the session rejects
/// those at the `save`/`delete` call site (spec §4.1), not through this
/// trait bound, since that check is a runtime value check, not a type-level
/// one the compiler can enforce for arbitrary caller types.
pub trait Entity:
    HasId + TypeName + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Entity for T where
    T: HasId + TypeName + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// An object-safe, type-erased handle onto a tracked entity.
///
/// The identity map, change tracker, and map/reduce pipeline all operate
/// through this trait so they can hold any number of distinct entity types
/// in the same session without becoming generic over all of them at once.
#[async_trait]
pub trait EntityHandle: Send + Sync {
    /// The entity's simplified type name.
    fn type_name(&self) -> &'static str;

    /// The entity's current document id, if assigned.
    async fn document_id(&self) -> Option<DocumentId>;

    /// Assigns the entity's document id (called once, on first insert).
    async fn set_document_id(&self, id: DocumentId);

    /// Returns the entity's current state as an owned, type-erased clone.
    /// Used by the map/reduce pipeline to invoke descriptor closures, and
    /// by the change tracker to compute the canonical serialized form for
    /// structural-equality diffing.
    async fn value(&self) -> Box<dyn Any + Send + Sync>;

    /// Returns the canonical serialized form of the entity's current state.
    async fn snapshot(&self) -> serde_json::Value;

    /// Deserializes `blob` as this handle's concrete entity type, type-erased.
    /// Used by the change tracker to recover a typed view of a previously
    /// persisted blob for `map_deleted` (spec §4.3 item 2), since document
    /// storage only ever hands back a `serde_json::Value`.
    async fn deserialize_snapshot(
        &self,
        blob: &serde_json::Value,
    ) -> crate::error::Result<Box<dyn Any + Send + Sync>>;

    /// Supports downcasting back to a concrete `TypedHandle<T>` so that
    /// `Session::get`/`save`/`delete` can recover the caller's `Arc<Mutex<T>>`.
    fn as_any(&self) -> &dyn Any;
}

/// The concrete [`EntityHandle`] implementation for one entity type `T`.
///
/// Wraps the shared, lockable cell the caller holds a clone of, so that
/// mutations the caller makes through their own `Arc<Mutex<T>>` are visible
/// to the session at commit time without the caller re-calling `save`.
pub struct TypedHandle<T: Entity> {
    cell: Arc<Mutex<T>>,
}

impl<T: Entity> TypedHandle<T> {
    /// Wraps an existing shared entity cell.
    pub fn new(cell: Arc<Mutex<T>>) -> Self {
        Self { cell }
    }

    /// Returns a clone of the shared cell.
    pub fn cell(&self) -> Arc<Mutex<T>> {
        Arc::clone(&self.cell)
    }
}

#[async_trait]
impl<T: Entity> EntityHandle for TypedHandle<T> {
    fn type_name(&self) -> &'static str {
        T::simple_type_name()
    }

    async fn document_id(&self) -> Option<DocumentId> {
        self.cell.lock().await.id()
    }

    async fn set_document_id(&self, id: DocumentId) {
        self.cell.lock().await.set_id(id);
    }

    async fn value(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.cell.lock().await.clone())
    }

    async fn snapshot(&self) -> serde_json::Value {
        let guard = self.cell.lock().await;
        serde_json::to_value(&*guard).expect("entity must be JSON-serializable")
    }

    async fn deserialize_snapshot(
        &self,
        blob: &serde_json::Value,
    ) -> crate::error::Result<Box<dyn Any + Send + Sync>> {
        let value: T = serde_json::from_value(blob.clone())?;
        Ok(Box::new(value))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Returns the pointer identity of a shared entity cell, used by the
/// identity map to implement the entity→id direction without requiring
/// entities to implement `PartialEq`/`Hash` themselves.
pub fn cell_identity<T>(cell: &Arc<Mutex<T>>) -> usize {
    Arc::as_ptr(cell) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

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

    #[tokio::test]
    async fn test_typed_handle_roundtrip() {
        let cell = Arc::new(Mutex::new(Person {
            id: None,
            name: "Ada".into(),
        }));
        let handle = TypedHandle::new(Arc::clone(&cell));

        assert_eq!(handle.document_id().await, None);
        handle.set_document_id(7).await;
        assert_eq!(handle.document_id().await, Some(7));
        assert_eq!(cell.lock().await.id, Some(7));

        let snap = handle.snapshot().await;
        assert_eq!(snap["name"], "Ada");
    }

    #[tokio::test]
    async fn test_cell_identity_stable_across_clones() {
        let cell = Arc::new(Mutex::new(Person::default()));
        let a = cell_identity(&cell);
        let b = cell_identity(&Arc::clone(&cell));
        assert_eq!(a, b);

        let other = Arc::new(Mutex::new(Person::default()));
        assert_ne!(a, cell_identity(&other));
    }

    #[tokio::test]
    async fn test_downcast_via_any() {
        let cell = Arc::new(Mutex::new(Person {
            id: None,
            name: "Grace".into(),
        }));
        let handle: Box<dyn EntityHandle> = Box::new(TypedHandle::new(Arc::clone(&cell)));
        let typed = handle
            .as_any()
            .downcast_ref::<TypedHandle<Person>>()
            .expect("downcast should succeed for matching type");
        assert_eq!(typed.cell().lock().await.name, "Grace");
    }
}
