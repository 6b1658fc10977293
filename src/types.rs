//! Core identifier and value types shared across the session engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A document identifier.
///
/// Assigned by the backing store when a `CreateDocument` command executes.
/// Unique and monotonic within the store (spec §3).
pub type DocumentId = i64;

/// A simplified (assembly-independent) name for an entity's runtime type.
///
/// Stored on the `Document` row and used to look up index descriptors.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimpleTypeName(pub String);

impl SimpleTypeName {
    /// Creates a new simple type name.
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the type name as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SimpleTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SimpleTypeName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SimpleTypeName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Transaction isolation level requested for the session's connection.
///
/// Captured at session construction (or via
/// [`Session::set_isolation_level`](crate::session::Session::set_isolation_level))
/// and read only once, when the transaction is opened (spec §4.1, §9).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Readers never see uncommitted writes from other transactions, but
    /// may see different values for the same row across repeated reads.
    ReadCommitted,

    /// Repeated reads of the same row within the transaction are stable.
    RepeatableRead,

    /// Strongest standard SQL isolation level; transactions behave as if
    /// executed serially.
    #[default]
    Serializable,

    /// Snapshot isolation: the transaction sees a consistent snapshot taken
    /// at its start, without blocking concurrent writers.
    Snapshot,
}

impl IsolationLevel {
    /// Returns the `SET TRANSACTION ISOLATION LEVEL` SQL fragment for this
    /// level. Used by the shipped SQL connection factory; a custom
    /// `ConnectionFactory` is free to ignore this and use a native API.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_type_name_display() {
        let name = SimpleTypeName::new("Person");
        assert_eq!(name.as_str(), "Person");
        assert_eq!(format!("{}", name), "Person");
    }

    #[test]
    fn test_isolation_level_default() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::Serializable);
    }

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::Snapshot.as_sql(), "SNAPSHOT");
    }
}
