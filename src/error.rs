//! Error types for the session engine.
//!
//! `SessionError` is the only error type returned by public `Session` APIs.
//! It wraps two sub-trees:
//! - `StorageError`, failures from the document store, connection
//!   factory, or a journaled/inline index command (spec §7 "Backend error").
//! - the two session-local kinds spec §7 calls out directly
//!   (`InvalidArgument`, `InvalidOperation`).
//!
//! # Error Handling Pattern
//! ```rust,ignore
//! use docsession::{Session, Result};
//!
//! async fn example(session: &mut Session) -> Result<()> {
//!     session.commit().await?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Top-level error enum returned by all public `Session` APIs.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Caller passed an argument the session cannot accept: saving a
    /// `Document` or `Index` object, or a null/missing entity.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was well-formed but cannot be completed in the current
    /// state: deleting an object without an id, reducing a descriptor with
    /// no group key, or a reduce fold returning null when a non-null result
    /// is required.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Failure from the document store, connection factory, or a journaled
    /// index command. Terminal for the current commit attempt; no internal
    /// retry is performed.
    #[error("backend error: {0}")]
    Backend(#[from] StorageError),
}

impl SessionError {
    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates an `InvalidOperation` error.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Returns true if this is an `InvalidArgument` error.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    /// Returns true if this is an `InvalidOperation` error.
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation(_))
    }

    /// Returns true if this is a backend/storage error.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Storage-layer errors: the document store, the connection factory, or a
/// journaled index command failed.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The document-storage collaborator (`load`/`save`/`delete`/`load_many`)
    /// returned an error.
    #[error("document store error: {0}")]
    DocumentStore(String),

    /// Opening a connection or beginning a transaction failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Commit or rollback of the underlying transaction failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A journaled or inline index command failed to execute.
    #[error("index command failed: {0}")]
    Command(String),

    /// Serializing or deserializing an entity blob failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Creates a document-store error.
    pub fn document_store(msg: impl Into<String>) -> Self {
        Self::DocumentStore(msg.into())
    }

    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a transaction error.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Creates an index-command error.
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Creates a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Command(err.to_string())
    }
}

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        SessionError::Backend(StorageError::from(err))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Backend(StorageError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = SessionError::invalid_argument("entity is a Document");
        assert_eq!(err.to_string(), "invalid argument: entity is a Document");
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_invalid_operation_display() {
        let err = SessionError::invalid_operation("missing group key");
        assert!(err.is_invalid_operation());
        assert!(!err.is_invalid_argument());
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: SessionError = StorageError::command("boom").into();
        assert!(err.is_backend());
        assert_eq!(err.to_string(), "backend error: index command failed: boom");
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SessionError = parse_err.into();
        assert!(err.is_backend());
    }
}
