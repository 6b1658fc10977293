//! The command journal: an ordered list of pending index mutations,
//! drained into the session's open transaction at commit time (spec §4.5).
//!
//! `CreateDocumentCommand` is deliberately absent here, spec §4.3 item 1
//! requires it to execute inline, synchronously, the moment a new entity
//! is first encountered, since the assigned document id must be known
//! before the rest of that entity's mapping can proceed. It lives next to
//! the document-store collaborator in `storage`, not in the journal.

use async_trait::async_trait;
use sqlx::{Any, Row, Transaction};
use tracing::instrument;

use crate::descriptor::IndexRow;
use crate::document::Document;
use crate::error::Result;
use crate::types::DocumentId;

/// One pending mutation against an index table. Opaque to the session:
/// the sole concrete coupling to the SQL dialect (spec §4.5).
#[async_trait]
pub trait IndexCommand: Send + Sync {
    /// Executes this command against the session's open transaction.
    async fn execute(&self, tx: &mut Transaction<'_, Any>) -> Result<()>;

    /// Short, human-readable description used in tracing spans and error
    /// messages.
    fn describe(&self) -> String;
}

/// Creates a brand-new index row (spec §4.4 step h, "no persisted row
/// existed and the final value is non-null").
///
/// `row.documents` is written as-is: for a pure-map row it is the row's
/// own (already complete) back-link set; for a freshly reduced group the
/// caller is expected to have set it to that group's initial contributing
/// document ids, since there is no persisted set yet to fold against.
pub struct CreateIndexCommand {
    pub row: IndexRow,
}

#[async_trait]
impl IndexCommand for CreateIndexCommand {
    async fn execute(&self, tx: &mut Transaction<'_, Any>) -> Result<()> {
        sqlx::query(&format!(
            "insert into {} (fields, group_key, documents) values (?, ?, ?)",
            self.row.index_type
        ))
        .bind(self.row.fields.to_string())
        .bind(self.row.group_key.as_ref().map(|v| v.to_string()))
        .bind(serde_json::to_string(&self.row.documents)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("CreateIndex({})", self.row.index_type)
    }
}

/// Updates an existing index row in place, adjusting its back-link set by
/// the given document deltas (spec §4.4 step h, persisted row + non-null
/// final value).
///
/// Two calling conventions, distinguished by whether `row.documents` is
/// populated:
/// - Pure-map re-emission: `row.documents` already holds the row's
///   complete back-link set (there is only ever one contributing
///   document per map row in this pipeline) and `added`/`removed` are
///   empty, the documents column is fully replaced from `row.documents`.
/// - Reduce finalization: `row.documents` is empty and `added`/`removed`
///   carry the delta to apply against the persisted documents column,
///   since a reduce row aggregates many documents that are never all
///   held in memory at once.
pub struct UpdateIndexCommand {
    pub row: IndexRow,
    pub added_document_ids: Vec<DocumentId>,
    pub removed_document_ids: Vec<DocumentId>,
}

#[async_trait]
impl IndexCommand for UpdateIndexCommand {
    async fn execute(&self, tx: &mut Transaction<'_, Any>) -> Result<()> {
        let id = self
            .row
            .id
            .expect("UpdateIndexCommand requires a persisted row id");

        let documents: Vec<DocumentId> = if !self.row.documents.is_empty() {
            self.row.documents.clone()
        } else {
            let current: String = sqlx::query_scalar(&format!(
                "select documents from {} where id = ?",
                self.row.index_type
            ))
            .bind(id)
            .fetch_one(&mut **tx)
            .await?;
            let mut docs: Vec<DocumentId> = serde_json::from_str(&current)?;
            docs.retain(|d| !self.removed_document_ids.contains(d));
            for d in &self.added_document_ids {
                if !docs.contains(d) {
                    docs.push(*d);
                }
            }
            docs
        };

        sqlx::query(&format!(
            "update {} set fields = ?, group_key = ?, documents = ? where id = ?",
            self.row.index_type
        ))
        .bind(self.row.fields.to_string())
        .bind(self.row.group_key.as_ref().map(|v| v.to_string()))
        .bind(serde_json::to_string(&documents)?)
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "UpdateIndex({}, +{} -{})",
            self.row.index_type,
            self.added_document_ids.len(),
            self.removed_document_ids.len()
        )
    }
}

/// Removes every map-index row keyed by a deleted document (spec §4.4
/// `map_deleted`, pure-map or no-delete-fold branch).
pub struct DeleteMapIndexCommand {
    pub index_type: String,
    pub document_id: DocumentId,
}

#[async_trait]
impl IndexCommand for DeleteMapIndexCommand {
    async fn execute(&self, tx: &mut Transaction<'_, Any>) -> Result<()> {
        // `documents` is a JSON array column, so a row belongs to
        // `self.document_id` only if the id is an element of that array, not
        // a substring of its rendered text (id 1 must not match `[11]`).
        // Every candidate row is fetched and parsed rather than matched with
        // `like`.
        let rows = sqlx::query(&format!("select id, documents from {}", self.index_type))
            .fetch_all(&mut **tx)
            .await?;
        for row in rows {
            let id: DocumentId = row.try_get("id").map_err(sqlx::Error::from)?;
            let documents: String = row.try_get("documents").map_err(sqlx::Error::from)?;
            let docs: Vec<DocumentId> = serde_json::from_str(&documents)?;
            if docs.contains(&self.document_id) {
                sqlx::query(&format!("delete from {} where id = ?", self.index_type))
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("DeleteMapIndex({}, doc={})", self.index_type, self.document_id)
    }
}

/// Removes a reduce-index row whose fold emptied to null (spec §4.4 step
/// h, persisted row existed + final value null).
pub struct DeleteReduceIndexCommand {
    pub row: IndexRow,
}

#[async_trait]
impl IndexCommand for DeleteReduceIndexCommand {
    async fn execute(&self, tx: &mut Transaction<'_, Any>) -> Result<()> {
        let id = self
            .row
            .id
            .expect("DeleteReduceIndexCommand requires a persisted row id");
        sqlx::query(&format!("delete from {} where id = ?", self.row.index_type))
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("DeleteReduceIndex({})", self.row.index_type)
    }
}

/// Removes a `Document` row for a deleted entity (spec §4.3 item 3).
pub struct DeleteDocumentCommand {
    pub document: Document,
}

#[async_trait]
impl IndexCommand for DeleteDocumentCommand {
    async fn execute(&self, tx: &mut Transaction<'_, Any>) -> Result<()> {
        sqlx::query("delete from documents where id = ?")
            .bind(self.document.id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("DeleteDocument({})", self.document.id)
    }
}

/// The session's ordered pending-command list.
///
/// Commands execute in append order (spec §5): inline `CreateDocument`
/// calls never enter the journal, so the journal's own order is exactly
/// map-emitted commands (in entity-processing order) followed by
/// reduce-finalization commands (in descriptor, then group-key, order).
#[derive(Default)]
pub struct Journal {
    commands: Vec<Box<dyn IndexCommand>>,
}

impl Journal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command to the end of the journal.
    pub fn push(&mut self, command: Box<dyn IndexCommand>) {
        self.commands.push(command);
    }

    /// Number of commands currently queued.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if no commands are queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drains every queued command into `tx`, executing them in order.
    /// Stops and propagates on the first failure, the caller is expected
    /// to roll back (spec §4.5).
    #[instrument(skip_all, fields(command_count = self.commands.len()))]
    pub async fn drain(&mut self, tx: &mut Transaction<'_, Any>) -> Result<()> {
        for command in self.commands.drain(..) {
            tracing::debug!(command = %command.describe(), "executing index command");
            command.execute(tx).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_push_and_len() {
        let mut journal = Journal::new();
        assert!(journal.is_empty());
        journal.push(Box::new(DeleteMapIndexCommand {
            index_type: "Widgets".into(),
            document_id: 1,
        }));
        assert_eq!(journal.len(), 1);
        assert!(!journal.is_empty());
    }

    #[test]
    fn test_command_descriptions() {
        let cmd = DeleteDocumentCommand {
            document: Document::new(9, "Widget"),
        };
        assert_eq!(cmd.describe(), "DeleteDocument(9)");
    }
}
