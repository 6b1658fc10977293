//! Configuration for a session.
//!
//! [`SessionConfig`] controls the one setting the session itself reads
//! before opening a transaction: the isolation level. It is the seam where
//! a real deployment would add pool sizing, statement timeouts, or retry
//! policy, which is why it keeps the builder/`validate()` shape even though
//! there is little to reject today.
//!
//! # Example
//! ```rust
//! use docsession::{SessionConfig, IsolationLevel};
//!
//! let config = SessionConfig {
//!     isolation_level: IsolationLevel::RepeatableRead,
//!     ..Default::default()
//! };
//! ```

use crate::error::SessionError;
use crate::types::IsolationLevel;

/// Session-level configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Isolation level used when the session's transaction is opened.
    ///
    /// Read once, at transaction-begin time (spec §4.1, §9). Changing it
    /// after the transaction has been opened is rejected rather than
    /// silently ignored; see
    /// [`Session::set_isolation_level`](crate::session::Session::set_isolation_level).
    pub isolation_level: IsolationLevel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
        }
    }
}

impl SessionConfig {
    /// Creates a new `SessionConfig` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config pinned to the given isolation level.
    pub fn with_isolation_level(level: IsolationLevel) -> Self {
        Self {
            isolation_level: level,
        }
    }

    /// Validates the configuration.
    ///
    /// Currently infallible: every `IsolationLevel` variant is valid for
    /// every supported backend, but kept as an explicit step so future
    /// settings (pool size, timeouts) have a natural place to reject bad
    /// values, following the teacher's `Config::validate()` convention.
    pub fn validate(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_isolation_level() {
        let config = SessionConfig::with_isolation_level(IsolationLevel::ReadCommitted);
        assert_eq!(config.isolation_level, IsolationLevel::ReadCommitted);
    }
}
