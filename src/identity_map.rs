//! The session's identity map: a bidirectional mapping between document
//! ids and the live entity instance tracked under that id.
//!
//! Every `get`/`save` within one session must hand back the same shared
//! entity for the same id (spec §4.2 invariant 4). The id→entity direction
//! is a straightforward map; the entity→id direction has no natural key in
//! Rust (entities are not required to implement `Hash`/`Eq`), so it is
//! keyed on the pointer identity of the entity's shared `Arc<Mutex<T>>`
//! cell instead.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::document::EntityHandle;
use crate::types::DocumentId;

/// Tracks every entity currently loaded or staged for insert within a
/// session, keyed both by document id and by the identity of its shared
/// cell.
///
/// Uses an `IndexMap` rather than a `HashMap` so that a full traversal
/// (used by `commit` to walk every tracked entity in load/save order)
/// is deterministic; this matters for the map/reduce pipeline's command
/// ordering (spec §5).
#[derive(Default)]
pub struct IdentityMap {
    by_id: IndexMap<DocumentId, Arc<dyn EntityHandle>>,
    id_by_identity: std::collections::HashMap<usize, DocumentId>,
}

impl IdentityMap {
    /// Creates an empty identity map.
    pub fn new() -> Self {
        Self {
            by_id: IndexMap::new(),
            id_by_identity: std::collections::HashMap::new(),
        }
    }

    /// Returns the tracked handle for `id`, if any.
    pub fn get(&self, id: DocumentId) -> Option<Arc<dyn EntityHandle>> {
        self.by_id.get(&id).cloned()
    }

    /// Returns the id a previously-tracked entity is known under, looked
    /// up by the pointer identity of its shared cell.
    pub fn id_for_identity(&self, identity: usize) -> Option<DocumentId> {
        self.id_by_identity.get(&identity).copied()
    }

    /// Registers `handle` under `id` and `identity`, replacing anything
    /// previously registered under either key.
    pub fn insert(&mut self, id: DocumentId, identity: usize, handle: Arc<dyn EntityHandle>) {
        self.by_id.insert(id, handle);
        self.id_by_identity.insert(identity, id);
    }

    /// Removes the entity tracked under `id`, if any, returning its handle.
    pub fn remove(&mut self, id: DocumentId) -> Option<Arc<dyn EntityHandle>> {
        let handle = self.by_id.shift_remove(&id);
        self.id_by_identity.retain(|_, tracked_id| *tracked_id != id);
        handle
    }

    /// Returns true if `id` is currently tracked.
    pub fn contains(&self, id: DocumentId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Iterates over every tracked `(id, handle)` pair in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (DocumentId, &Arc<dyn EntityHandle>)> {
        self.by_id.iter().map(|(id, handle)| (*id, handle))
    }

    /// Number of entities currently tracked.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if no entities are tracked.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Discards every tracked entity, used by `Session::cancel`.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.id_by_identity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{cell_identity, HasId, TypeName, TypedHandle};
    use serde::{Deserialize, Serialize};
    use tokio::sync::Mutex;

    #[derive(Clone, Debug, Serialize, Deserialize, Default)]
    struct Widget {
        id: Option<DocumentId>,
    }

    impl HasId for Widget {
        fn id(&self) -> Option<DocumentId> {
            self.id
        }
        fn set_id(&mut self, id: DocumentId) {
            self.id = Some(id);
        }
    }

    impl TypeName for Widget {
        fn simple_type_name() -> &'static str {
            "Widget"
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut map = IdentityMap::new();
        let cell = Arc::new(Mutex::new(Widget::default()));
        let identity = cell_identity(&cell);
        let handle: Arc<dyn EntityHandle> = Arc::new(TypedHandle::new(cell));

        map.insert(1, identity, Arc::clone(&handle));
        assert!(map.contains(1));
        assert_eq!(map.id_for_identity(identity), Some(1));

        let removed = map.remove(1);
        assert!(removed.is_some());
        assert!(!map.contains(1));
        assert_eq!(map.id_for_identity(identity), None);
    }

    #[test]
    fn test_iteration_order_is_insertion_order() {
        let mut map = IdentityMap::new();
        for id in [3, 1, 2] {
            let cell = Arc::new(Mutex::new(Widget::default()));
            let identity = cell_identity(&cell);
            map.insert(id, identity, Arc::new(TypedHandle::new(cell)));
        }
        let ids: Vec<DocumentId> = map.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_clear() {
        let mut map = IdentityMap::new();
        let cell = Arc::new(Mutex::new(Widget::default()));
        map.insert(1, cell_identity(&cell), Arc::new(TypedHandle::new(cell)));
        map.clear();
        assert!(map.is_empty());
    }
}
