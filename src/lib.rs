//! # docsession
//!
//! A document-oriented unit-of-work session over a relational backing
//! store, with automatically maintained map and map/reduce index
//! projections.
//!
//! Application objects ("entities") are persisted as opaque serialized
//! blobs keyed by an auto-assigned integer document id. Queryable
//! projections of those documents ("indexes") are kept consistent with
//! the documents automatically: a **map index** emits zero or more rows
//! per source document, and a **map/reduce index** aggregates rows into
//! one row per distinct group-key value, incrementally folded as
//! documents are saved and deleted.
//!
//! This crate implements only the unit-of-work [`Session`]: the
//! component that batches pending saves and deletes, drives the
//! map/reduce pipeline, serializes the resulting mutations into an
//! ordered sequence of index commands, and executes them inside one
//! transaction. Document storage, the connection/transaction provider,
//! the SQL dialect, and the index descriptor registry are external
//! collaborators reached only through the traits in [`storage`] and
//! [`descriptor`], this crate ships a working implementation of each so
//! the engine is independently usable, but a deployment is free to
//! supply its own.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docsession::prelude::*;
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! struct Person { id: Option<i64>, name: String }
//!
//! impl HasId for Person {
//!     fn id(&self) -> Option<i64> { self.id }
//!     fn set_id(&mut self, id: i64) { self.id = Some(id); }
//! }
//! impl TypeName for Person {
//!     fn simple_type_name() -> &'static str { "Person" }
//! }
//!
//! # async fn run() -> docsession::Result<()> {
//! let pool = docsession::storage::sql::connect("sqlite::memory:").await?;
//! let deps = SessionDeps {
//!     document_store: Arc::new(docsession::storage::sql::SqlDocumentStore::new()),
//!     document_rows: Arc::new(docsession::storage::sql::SqlDocumentRowStore::new()),
//!     reduce_query: Arc::new(docsession::storage::sql::SqlReduceIndexQuery::new()),
//!     connection_factory: Arc::new(docsession::storage::sql::SqlConnectionFactory::new(pool)),
//!     descriptor_registry: Arc::new(InMemoryDescriptorRegistry::new()),
//! };
//! let mut session = Session::new(deps, SessionConfig::default());
//!
//! let person = Arc::new(Mutex::new(Person { id: None, name: "Ada".into() }));
//! session.save(Arc::clone(&person)).await?;
//! session.dispose().await?;
//! # Ok(()) }
//! ```
//!
//! ## Key Concepts
//!
//! - **Document**: the `{id, type}` header row that anchors a serialized
//!   entity blob.
//! - **Identity map**: within one session, `get`/`save` always hand back
//!   the same shared instance for the same document id.
//! - **Index descriptor**: registered per `(entity type, index type)`,
//!   declares how an entity maps into index rows and, for a map/reduce
//!   index, how those rows fold into one aggregate per group key.
//! - **Journal**: the ordered sequence of index commands a commit
//!   produces, drained into the transaction in a deterministic order.
//!
//! ## Out of scope
//!
//! Multi-session coordination, distributed transactions, schema
//! migration, crash recovery beyond the backing store's transactional
//! guarantees, and caching across session lifetimes.
//!
//! ## Thread Safety
//!
//! [`Session`] is not safe for concurrent use, it is owned by exactly
//! one logical task at a time. Its collaborators (`Arc<dyn DocumentStore>`
//! etc.) are `Send + Sync` and may be shared across many sessions.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod config;
mod error;
mod identity_map;
mod mapreduce;
mod tracker;
mod types;

pub mod descriptor;
pub mod document;
pub mod journal;
pub mod session;
pub mod storage;

// ============================================================================
// Public API re-exports
// ============================================================================

// Configuration
pub use config::SessionConfig;

// Error handling
pub use error::{Result, SessionError, StorageError};

// Core types
pub use types::{DocumentId, IsolationLevel, SimpleTypeName};

// Document/entity plumbing
pub use document::{Entity, HasId, TypeName};

// Descriptors
pub use descriptor::{
    DescriptorRegistry, IndexDescriptor, IndexRow, InMemoryDescriptorRegistry, MapState,
    TypedDescriptor,
};

// Session
pub use session::{QueryHandle, Session, SessionDeps};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common `docsession` usage.
///
/// ```rust
/// use docsession::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::descriptor::{DescriptorRegistry, IndexDescriptor, IndexRow, InMemoryDescriptorRegistry};
    pub use crate::document::{Entity, HasId, TypeName};
    pub use crate::error::{Result, SessionError};
    pub use crate::session::{Session, SessionDeps};
    pub use crate::types::{DocumentId, IsolationLevel};
}
