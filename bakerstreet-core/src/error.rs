//! Error types for the registry core

use thiserror::Error;

/// Registry error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Key absent. A legitimate outcome, not a failure worth logging as one.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency mismatch. `actual` is `None` when the key
    /// disappeared since the caller read it.
    #[error("Version conflict on {key}: expected {expected}, found {}", display_version(.actual))]
    Conflict {
        key: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Conflicts are always retryable by re-reading and reapplying.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

fn display_version(version: &Option<u64>) -> String {
    version.map_or_else(|| "no entry".to_string(), |v| v.to_string())
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, Error>;
