//! The map/reduce pipeline: accumulates per-descriptor map deltas as
//! entities are created, changed, or deleted during a session, then folds
//! them by group key into index commands at commit time (spec §4.4).
//!
//! There is no teacher analog for this module. PulseDB has no projection
//! layer, so it is built directly from the spec's step-by-step procedure,
//! keeping the teacher's instrumentation and no-panic `Result` style.

use std::any::Any;
use std::sync::Arc;

use sqlx::{Any as AnyDb, Transaction};
use tracing::instrument;

use crate::descriptor::{IndexDescriptor, IndexRow, MapState, MapStateKind};
use crate::document::Document;
use crate::error::{Result, SessionError};
use crate::journal::{
    CreateIndexCommand, DeleteMapIndexCommand, DeleteReduceIndexCommand, Journal,
    UpdateIndexCommand,
};
use crate::storage::ReduceIndexQuery;
use crate::types::DocumentId;

/// Accumulates map deltas for every reduce descriptor touched during one
/// session, and finalizes them into index commands at commit time.
///
/// Pure-map (no-reduce) descriptors never accumulate here: `map_new` and
/// `map_deleted` emit their commands inline, as spec §4.4 requires.
#[derive(Default)]
pub struct MapReducePipeline {
    /// Keyed by `index_type`; holds every `MapState` accumulated this
    /// session for that reduce descriptor, in the order they were
    /// produced (load/save order, per spec §5).
    accumulated: Vec<(String, MapState)>,
}

impl MapReducePipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the mapping for a freshly persisted (or re-persisted) entity
    /// against every descriptor registered for its type, emitting inline
    /// index commands for pure-map descriptors and accumulating `New`
    /// states for reduce descriptors (spec §4.4 `map_new`).
    #[instrument(skip_all, fields(document_id = doc.id, type_name = %doc.type_name))]
    pub fn map_new(
        &mut self,
        doc: &Document,
        entity: &dyn Any,
        descriptors: &[Arc<dyn IndexDescriptor>],
        journal: &mut Journal,
    ) {
        for descriptor in descriptors {
            let rows = descriptor.map(entity);
            for mut row in rows {
                row.documents.push(doc.id);

                if descriptor.group_key_field().is_none() {
                    if row.id.is_none() {
                        journal.push(Box::new(CreateIndexCommand { row }));
                    } else {
                        journal.push(Box::new(UpdateIndexCommand {
                            row,
                            added_document_ids: Vec::new(),
                            removed_document_ids: Vec::new(),
                        }));
                    }
                } else {
                    self.accumulated.push((
                        descriptor.index_type().to_string(),
                        MapState::new(row, MapStateKind::New, doc.id),
                    ));
                }
            }
        }
    }

    /// Runs the mapping for a document that was deleted, or whose prior
    /// value no longer applies because the entity changed (spec §4.4
    /// `map_deleted`).
    #[instrument(skip_all, fields(document_id = doc.id, type_name = %doc.type_name))]
    pub fn map_deleted(
        &mut self,
        doc: &Document,
        old_entity: &dyn Any,
        descriptors: &[Arc<dyn IndexDescriptor>],
        journal: &mut Journal,
    ) {
        for descriptor in descriptors {
            let has_reduce = descriptor.group_key_field().is_some();
            if !has_reduce || !descriptor.has_delete() {
                journal.push(Box::new(DeleteMapIndexCommand {
                    index_type: descriptor.index_type().to_string(),
                    document_id: doc.id,
                }));
                continue;
            }

            for mut row in descriptor.map(old_entity) {
                row.documents.push(doc.id);
                self.accumulated.push((
                    descriptor.index_type().to_string(),
                    MapState::new(row, MapStateKind::Delete, doc.id),
                ));
            }
        }
    }

    /// Folds every accumulated `MapState` by group key and emits the
    /// resulting reduce-index commands (spec §4.4 steps a–h). Runs once,
    /// after all per-entity work in a commit.
    #[instrument(skip_all)]
    pub async fn finalize(
        &mut self,
        descriptors: &[Arc<dyn IndexDescriptor>],
        reduce_query: &dyn ReduceIndexQuery,
        tx: &mut Transaction<'_, AnyDb>,
        journal: &mut Journal,
    ) -> Result<()> {
        let accumulated = std::mem::take(&mut self.accumulated);

        for descriptor in descriptors {
            let Some(_group_key_field) = descriptor.group_key_field() else {
                continue;
            };
            let index_type = descriptor.index_type().to_string();
            let states: Vec<&MapState> = accumulated
                .iter()
                .filter(|(ty, _)| ty == &index_type)
                .map(|(_, state)| state)
                .collect();
            if states.is_empty() {
                continue;
            }

            let mut seen_keys: Vec<serde_json::Value> = Vec::new();
            for state in &states {
                let key = state
                    .row
                    .group_key
                    .clone()
                    .unwrap_or(serde_json::Value::Null);
                if !seen_keys.contains(&key) {
                    seen_keys.push(key);
                }
            }

            for key in seen_keys {
                self.finalize_group(descriptor.as_ref(), &index_type, &key, &states, reduce_query, tx, journal)
                    .await?;
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(index_type = %index_type))]
    async fn finalize_group(
        &self,
        descriptor: &dyn IndexDescriptor,
        index_type: &str,
        key: &serde_json::Value,
        states: &[&MapState],
        reduce_query: &dyn ReduceIndexQuery,
        tx: &mut Transaction<'_, AnyDb>,
        journal: &mut Journal,
    ) -> Result<()> {
        let matches_key = |s: &&MapState| {
            s.row.group_key.as_ref().unwrap_or(&serde_json::Value::Null) == key
        };
        let new_group: Vec<IndexRow> = states
            .iter()
            .filter(|s| s.kind == MapStateKind::New)
            .filter(matches_key)
            .map(|s| s.row.clone())
            .collect();
        let delete_group: Vec<IndexRow> = states
            .iter()
            .filter(|s| s.kind == MapStateKind::Delete)
            .filter(matches_key)
            .map(|s| s.row.clone())
            .collect();
        let update_group: Vec<IndexRow> = states
            .iter()
            .filter(|s| s.kind == MapStateKind::Update)
            .filter(matches_key)
            .map(|s| s.row.clone())
            .collect();

        let persisted = reduce_query.find_reduced(tx, index_type, key).await?;

        let mut current: Option<serde_json::Value> = None;

        if !new_group.is_empty() {
            let reduced = descriptor.reduce(key, &new_group).ok_or_else(|| {
                SessionError::invalid_operation(format!(
                    "reduce for '{index_type}' returned no value for a non-empty new group"
                ))
            })?;
            current = Some(reduced);
        }

        current = match (&persisted, current) {
            (Some((_, persisted_value)), Some(new_value)) => {
                let persisted_row = IndexRow::new(index_type, persisted_value.clone())
                    .with_group_key(key.clone());
                let new_row = IndexRow::new(index_type, new_value).with_group_key(key.clone());
                Some(descriptor.reduce(key, &[persisted_row, new_row]).ok_or_else(|| {
                    SessionError::invalid_operation(format!(
                        "reduce for '{index_type}' returned no value while folding with the persisted row"
                    ))
                })?)
            }
            (Some((_, persisted_value)), None) => Some(persisted_value.clone()),
            (None, Some(new_value)) => Some(new_value),
            (None, None) => None,
        };

        if let Some(ref current_value) = current {
            if !delete_group.is_empty() {
                current = descriptor.delete(current_value, &delete_group);
            }
        }

        if let Some(ref current_value) = current {
            if !update_group.is_empty() {
                current = descriptor.update(current_value, &update_group);
            }
        }

        let added_doc_ids: Vec<DocumentId> =
            new_group.iter().flat_map(|r| r.documents.iter().copied()).collect();
        let removed_doc_ids: Vec<DocumentId> =
            delete_group.iter().flat_map(|r| r.documents.iter().copied()).collect();

        match (persisted, current) {
            (Some((id, fields)), None) => {
                journal.push(Box::new(DeleteReduceIndexCommand {
                    row: IndexRow {
                        id: Some(id),
                        index_type: index_type.to_string(),
                        group_key: Some(key.clone()),
                        fields,
                        documents: Vec::new(),
                    },
                }));
            }
            (Some((id, _)), Some(final_value)) => {
                let row = IndexRow {
                    id: Some(id),
                    index_type: index_type.to_string(),
                    group_key: Some(key.clone()),
                    fields: final_value,
                    documents: Vec::new(),
                };
                journal.push(Box::new(UpdateIndexCommand {
                    row,
                    added_document_ids: added_doc_ids,
                    removed_document_ids: removed_doc_ids,
                }));
            }
            (None, Some(final_value)) => {
                // Brand-new group: there is no persisted document set to fold
                // deltas against, so the initial contributing ids become the
                // row's own back-link set directly.
                let row = IndexRow {
                    id: None,
                    index_type: index_type.to_string(),
                    group_key: Some(key.clone()),
                    fields: final_value,
                    documents: added_doc_ids,
                };
                journal.push(Box::new(CreateIndexCommand { row }));
            }
            (None, None) => {}
        }

        Ok(())
    }

    /// Discards all accumulated state without finalizing (used by
    /// `Session::cancel`'s path through `dispose`, where the transaction
    /// is rolled back rather than drained).
    pub fn clear(&mut self) {
        self.accumulated.clear();
    }
}
