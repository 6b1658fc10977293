//! Change tracker: the pending-save and pending-delete sets, plus the
//! structural-equality check `Session::commit` uses to decide whether a
//! tracked entity actually changed (spec §4.3).
//!
//! Entities already present in the identity map are not queued here;
//! `Session::save` treats re-saving a tracked entity as a no-op, deferring
//! to diffing at commit time (spec §4.1). This tracker only holds entities
//! that are not yet tracked (fresh inserts) and explicit deletes.

use std::sync::Arc;

use crate::document::{cell_identity, EntityHandle};

/// The outcome of comparing a tracked entity's current value against its
/// last-persisted blob, per spec §4.3 item 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The serialized forms are identical; no document write, no map/reduce
    /// work, zero index commands (spec §8 property 5).
    Unchanged,
    /// The serialized forms differ; `map_deleted` then `map_new` must run
    /// and the new blob must be persisted.
    Changed,
}

/// Compares two canonical entity snapshots for structural equality.
///
/// `serde_json::Value`'s `PartialEq` is already key-order independent for
/// objects (the crate is built without the `preserve_order` feature), so
/// this is exactly the structural equality the spec calls for: no field
/// order or formatting sensitivity.
pub fn decide(old: &serde_json::Value, new: &serde_json::Value) -> Decision {
    if old == new {
        Decision::Unchanged
    } else {
        Decision::Changed
    }
}

/// Pending-save and pending-delete accumulation for one session.
#[derive(Default)]
pub struct ChangeTracker {
    pending_saves: Vec<(usize, Arc<dyn EntityHandle>)>,
    pending_deletes: Vec<Arc<dyn EntityHandle>>,
}

impl ChangeTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `handle` as a new entity to be inserted at commit time.
    ///
    /// Returns `false` without queuing if this exact cell (by pointer
    /// identity) is already queued, so repeated `save()` calls on the same
    /// not-yet-tracked entity don't produce duplicate `CreateDocument`
    /// commands.
    pub fn queue_save(&mut self, identity: usize, handle: Arc<dyn EntityHandle>) -> bool {
        if self.pending_saves.iter().any(|(i, _)| *i == identity) {
            return false;
        }
        self.pending_saves.push((identity, handle));
        true
    }

    /// Queues `handle` for deletion at commit time.
    pub fn queue_delete(&mut self, handle: Arc<dyn EntityHandle>) {
        self.pending_deletes.push(handle);
    }

    /// Drains and returns every pending save, in the order they were
    /// queued, paired with the pointer identity of each entity's backing
    /// cell (the caller needs it to populate the identity map once the
    /// new document id is assigned).
    pub fn take_saves(&mut self) -> Vec<(usize, Arc<dyn EntityHandle>)> {
        std::mem::take(&mut self.pending_saves)
    }

    /// Drains and returns every pending delete, in the order they were
    /// queued.
    pub fn take_deletes(&mut self) -> Vec<Arc<dyn EntityHandle>> {
        std::mem::take(&mut self.pending_deletes)
    }

    /// Returns true if the cell behind `handle` is already queued for
    /// insertion as a new entity.
    pub fn is_pending_save(&self, identity: usize) -> bool {
        self.pending_saves.iter().any(|(i, _)| *i == identity)
    }

    /// Returns the pointer identity of a tracked handle's backing cell,
    /// looked up through its type-erased `Any` view. Exposed so `Session`
    /// can avoid re-deriving identity logic that belongs with
    /// [`cell_identity`].
    pub fn identity_of<T>(cell: &Arc<tokio::sync::Mutex<T>>) -> usize {
        cell_identity(cell)
    }

    /// Discards all pending work without executing it (used by `cancel`
    /// followed by a fresh session, or by tests).
    pub fn clear(&mut self) {
        self.pending_saves.clear();
        self.pending_deletes.clear();
    }

    /// Number of entities queued as pending saves.
    pub fn pending_save_count(&self) -> usize {
        self.pending_saves.len()
    }

    /// Number of entities queued as pending deletes.
    pub fn pending_delete_count(&self) -> usize {
        self.pending_deletes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{HasId, TypeName, TypedHandle};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Clone, Debug, Serialize, Deserialize, Default)]
    struct Thing {
        id: Option<i64>,
        value: i32,
    }

    impl HasId for Thing {
        fn id(&self) -> Option<i64> {
            self.id
        }
        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }
    }

    impl TypeName for Thing {
        fn simple_type_name() -> &'static str {
            "Thing"
        }
    }

    #[test]
    fn test_decide_unchanged_and_changed() {
        let a = json!({"value": 1});
        let b = json!({"value": 1});
        let c = json!({"value": 2});
        assert_eq!(decide(&a, &b), Decision::Unchanged);
        assert_eq!(decide(&a, &c), Decision::Changed);
    }

    #[test]
    fn test_decide_key_order_independent() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(decide(&a, &b), Decision::Unchanged);
    }

    #[test]
    fn test_queue_save_deduplicates_by_identity() {
        let mut tracker = ChangeTracker::new();
        let cell = Arc::new(Mutex::new(Thing::default()));
        let identity = cell_identity(&cell);
        let handle: Arc<dyn EntityHandle> = Arc::new(TypedHandle::new(cell));

        assert!(tracker.queue_save(identity, Arc::clone(&handle)));
        assert!(!tracker.queue_save(identity, Arc::clone(&handle)));
        assert_eq!(tracker.pending_save_count(), 1);

        let drained = tracker.take_saves();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, identity);
        assert_eq!(tracker.pending_save_count(), 0);
    }

    #[test]
    fn test_queue_delete_and_clear() {
        let mut tracker = ChangeTracker::new();
        let cell = Arc::new(Mutex::new(Thing::default()));
        tracker.queue_delete(Arc::new(TypedHandle::new(cell)));
        assert_eq!(tracker.pending_delete_count(), 1);
        tracker.clear();
        assert_eq!(tracker.pending_delete_count(), 0);
    }
}
