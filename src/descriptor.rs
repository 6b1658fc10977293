//! Index descriptors: the DSL that declares how one entity type projects
//! into index rows, and the registry that looks descriptors up by type
//! name (spec §3, §6 "Descriptor registry").
//!
//! A descriptor is generic over its entity type `T` when it is built
//! (`TypedDescriptor<T>`), but is stored and invoked through the
//! object-safe [`IndexDescriptor`] trait so the map/reduce pipeline can
//! hold descriptors for many unrelated entity types in one registry,
//! mirroring the [`crate::document::TypedHandle`] type-erasure pattern.

use std::any::Any;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::document::Entity;
use crate::types::DocumentId;

/// One projected row of an index, either a map-index row (no group key)
/// or a reduce-index row (keyed by `group_key`).
#[derive(Clone, Debug, PartialEq)]
pub struct IndexRow {
    /// Row id once persisted; `None` for a row not yet written.
    pub id: Option<DocumentId>,
    /// Name of the index type this row belongs to.
    pub index_type: String,
    /// The row's group-key value, if this index declares one.
    pub group_key: Option<serde_json::Value>,
    /// The row's projected fields, as produced by the descriptor's map
    /// (or reduce/delete/update) function.
    pub fields: serde_json::Value,
    /// For a map-index row: the full back-link set of contributing
    /// document ids (spec §3 invariant 2). For a row mid-accumulation in
    /// one commit: the delta of documents added or removed by this
    /// commit, consumed by reduce finalization step (g).
    pub documents: Vec<DocumentId>,
}

impl IndexRow {
    /// Creates a fresh, unpersisted row.
    pub fn new(index_type: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            id: None,
            index_type: index_type.into(),
            group_key: None,
            fields,
            documents: Vec::new(),
        }
    }

    /// Sets the row's group key (builder style, used by map functions
    /// that produce reduce-index rows).
    pub fn with_group_key(mut self, key: serde_json::Value) -> Self {
        self.group_key = Some(key);
        self
    }

    /// Adds a contributing document id to this row's back-link set.
    pub fn with_document(mut self, id: DocumentId) -> Self {
        self.documents.push(id);
        self
    }
}

/// Which lifecycle event produced a [`MapState`] (spec §3).
///
/// The pipeline in spec §4.4 only ever constructs `New` (from `map_new`)
/// and `Delete` (from `map_deleted`) states directly; `Update` names the
/// conceptual case of a re-saved, changed entity, which the pipeline
/// implements as a `Delete` of the old mapping followed by a `New` of the
/// new one rather than a single `Update` state (see the delete-then-new
/// resolution documented in `DESIGN.md`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapStateKind {
    /// A freshly mapped row from a newly persisted entity.
    New,
    /// A row re-emitted because its source entity changed, without a
    /// change of group key. Reserved for an implementation that folds
    /// update-in-place rather than delete-then-new; unused by this
    /// pipeline.
    Update,
    /// A row that no longer applies because its source entity was
    /// deleted, or the old value of a changed entity no longer maps to it.
    Delete,
}

/// One accumulated map-delta for a reduce descriptor, held until reduce
/// finalization runs (spec §4.4).
#[derive(Clone, Debug)]
pub struct MapState {
    /// The mapped row.
    pub row: IndexRow,
    /// Which lifecycle event produced this state.
    pub kind: MapStateKind,
    /// The document that produced (or, for `Delete`, previously produced)
    /// this row.
    pub document_id: DocumentId,
}

impl MapState {
    /// Creates a new accumulated map state.
    pub fn new(row: IndexRow, kind: MapStateKind, document_id: DocumentId) -> Self {
        Self {
            row,
            kind,
            document_id,
        }
    }
}

/// Object-safe view of one registered `(entity type, index type)`
/// descriptor (spec §3 `IndexDescriptor`, §6 "Descriptor registry").
pub trait IndexDescriptor: Send + Sync {
    /// Name of the index type this descriptor produces rows for.
    fn index_type(&self) -> &str;

    /// Name of the group-key field, if this is a reduce descriptor.
    /// `None` marks a pure map descriptor.
    fn group_key_field(&self) -> Option<&str>;

    /// Maps one entity (type-erased) into zero or more index rows.
    fn map(&self, entity: &dyn Any) -> Vec<IndexRow>;

    /// Folds a fresh group of `New`-state rows into a reduced value.
    /// Only called for descriptors with a group key. Must return
    /// `Some`: an empty fold is a configuration error the caller
    /// surfaces as `InvalidOperation` (spec §4.4 step b).
    fn reduce(&self, key: &serde_json::Value, rows: &[IndexRow]) -> Option<serde_json::Value>;

    /// Folds deleted rows out of a current reduced value. `None` means
    /// the group has been emptied entirely.
    fn delete(
        &self,
        current: &serde_json::Value,
        deleted_rows: &[IndexRow],
    ) -> Option<serde_json::Value>;

    /// Folds updated rows into a current reduced value.
    fn update(
        &self,
        current: &serde_json::Value,
        updated_rows: &[IndexRow],
    ) -> Option<serde_json::Value>;

    /// Whether a delete fold was registered. `map_deleted` uses this to
    /// choose between the bulk `DeleteMapIndexCommand` path and the
    /// accumulate-for-reduce path (spec §4.4 `map_deleted`).
    fn has_delete(&self) -> bool;

    /// Whether an update fold was registered.
    fn has_update(&self) -> bool;
}

type MapFn<T> = Arc<dyn Fn(&T) -> Vec<IndexRow> + Send + Sync>;
type ReduceFn = Arc<dyn Fn(&serde_json::Value, &[IndexRow]) -> Option<serde_json::Value> + Send + Sync>;
type FoldFn = Arc<dyn Fn(&serde_json::Value, &[IndexRow]) -> Option<serde_json::Value> + Send + Sync>;

/// A descriptor built for one concrete entity type `T`, registered behind
/// the object-safe [`IndexDescriptor`] trait.
pub struct TypedDescriptor<T: Entity> {
    index_type: String,
    group_key_field: Option<String>,
    map_fn: MapFn<T>,
    reduce_fn: Option<ReduceFn>,
    delete_fn: Option<FoldFn>,
    update_fn: Option<FoldFn>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Entity> TypedDescriptor<T> {
    /// Builds a pure map descriptor (no reduce/delete/update fold).
    pub fn map_only(
        index_type: impl Into<String>,
        map_fn: impl Fn(&T) -> Vec<IndexRow> + Send + Sync + 'static,
    ) -> Self {
        Self {
            index_type: index_type.into(),
            group_key_field: None,
            map_fn: Arc::new(map_fn),
            reduce_fn: None,
            delete_fn: None,
            update_fn: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Builds a map/reduce descriptor with a group key and a reduce fold.
    /// `delete`/`update` folds may be added with
    /// [`with_delete`](Self::with_delete)/[`with_update`](Self::with_update).
    pub fn map_reduce(
        index_type: impl Into<String>,
        group_key_field: impl Into<String>,
        map_fn: impl Fn(&T) -> Vec<IndexRow> + Send + Sync + 'static,
        reduce_fn: impl Fn(&serde_json::Value, &[IndexRow]) -> Option<serde_json::Value>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            index_type: index_type.into(),
            group_key_field: Some(group_key_field.into()),
            map_fn: Arc::new(map_fn),
            reduce_fn: Some(Arc::new(reduce_fn)),
            delete_fn: None,
            update_fn: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Adds a delete fold.
    pub fn with_delete(
        mut self,
        delete_fn: impl Fn(&serde_json::Value, &[IndexRow]) -> Option<serde_json::Value>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.delete_fn = Some(Arc::new(delete_fn));
        self
    }

    /// Adds an update fold.
    pub fn with_update(
        mut self,
        update_fn: impl Fn(&serde_json::Value, &[IndexRow]) -> Option<serde_json::Value>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.update_fn = Some(Arc::new(update_fn));
        self
    }
}

impl<T: Entity> IndexDescriptor for TypedDescriptor<T> {
    fn index_type(&self) -> &str {
        &self.index_type
    }

    fn group_key_field(&self) -> Option<&str> {
        self.group_key_field.as_deref()
    }

    fn map(&self, entity: &dyn Any) -> Vec<IndexRow> {
        let entity = entity
            .downcast_ref::<T>()
            .expect("descriptor invoked with mismatched entity type");
        (self.map_fn)(entity)
    }

    fn reduce(&self, key: &serde_json::Value, rows: &[IndexRow]) -> Option<serde_json::Value> {
        self.reduce_fn.as_ref().and_then(|f| f(key, rows))
    }

    fn delete(
        &self,
        current: &serde_json::Value,
        deleted_rows: &[IndexRow],
    ) -> Option<serde_json::Value> {
        match &self.delete_fn {
            Some(f) => f(current, deleted_rows),
            None => None,
        }
    }

    fn update(
        &self,
        current: &serde_json::Value,
        updated_rows: &[IndexRow],
    ) -> Option<serde_json::Value> {
        match &self.update_fn {
            Some(f) => f(current, updated_rows),
            None => None,
        }
    }

    fn has_delete(&self) -> bool {
        self.delete_fn.is_some()
    }

    fn has_update(&self) -> bool {
        self.update_fn.is_some()
    }
}

/// Looks descriptors up by the simplified entity type name they were
/// registered under (spec §6).
pub trait DescriptorRegistry: Send + Sync {
    /// Returns every descriptor registered for `type_name`, in
    /// registration order.
    fn descriptors_for(&self, type_name: &str) -> Vec<Arc<dyn IndexDescriptor>>;

    /// Returns every descriptor registered for any type, in registration
    /// order. Used by reduce finalization (spec §4.4), which must visit
    /// every reduce descriptor touched during the session regardless of
    /// which entity type produced the accumulated states.
    fn all_descriptors(&self) -> Vec<Arc<dyn IndexDescriptor>>;
}

/// An in-process, insertion-ordered descriptor registry, suitable for both
/// production use (descriptors are typically registered once at startup)
/// and tests.
///
/// Backed by `IndexMap` rather than `HashMap` so [`all_descriptors`](
/// Self::all_descriptors) visits different entity types' descriptors in
/// registration order: reduce finalization (spec §4.4) drains them in that
/// order, and spec §5 requires the resulting command order to be stable
/// across runs.
#[derive(Default)]
pub struct InMemoryDescriptorRegistry {
    by_type: IndexMap<String, Vec<Arc<dyn IndexDescriptor>>>,
}

impl InMemoryDescriptorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `descriptor` for `type_name`.
    pub fn register(&mut self, type_name: impl Into<String>, descriptor: Arc<dyn IndexDescriptor>) {
        self.by_type.entry(type_name.into()).or_default().push(descriptor);
    }
}

impl DescriptorRegistry for InMemoryDescriptorRegistry {
    fn descriptors_for(&self, type_name: &str) -> Vec<Arc<dyn IndexDescriptor>> {
        self.by_type.get(type_name).cloned().unwrap_or_default()
    }

    fn all_descriptors(&self) -> Vec<Arc<dyn IndexDescriptor>> {
        self.by_type.values().flatten().cloned().collect()
    }
}
