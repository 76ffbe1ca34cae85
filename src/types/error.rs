//! Error types for the batch layer
//!
//! Pattern adapted from doorway/src/types/error.rs

use serde::Serialize;

use crate::handlers::OperationKind;

/// One failed unit of a flush: a coalesced intent or a dispatcher group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushFailure {
    /// Dedup id of the intent, or `kind:collection` for a dispatcher group
    pub key: String,
    /// Number of buffered records lost with this failure
    pub records: usize,
    /// Rendered error
    pub message: String,
}

impl FlushFailure {
    pub fn new(key: impl Into<String>, records: usize, error: &BatchError) -> Self {
        Self {
            key: key.into(),
            records,
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for FlushFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} records): {}", self.key, self.records, self.message)
    }
}

/// Main error type for batch operations
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No handler registered for {kind} on '{collection}'")]
    HandlerNotFound {
        collection: String,
        kind: OperationKind,
    },

    #[error("{} buffered write(s) failed in '{buffer}': {}", .failures.len(), render_failures(.failures))]
    Aggregate {
        buffer: String,
        failures: Vec<FlushFailure>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn render_failures(failures: &[FlushFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl BatchError {
    /// Failures carried by an aggregate error (empty for every other variant)
    pub fn failures(&self) -> &[FlushFailure] {
        match self {
            Self::Aggregate { failures, .. } => failures,
            _ => &[],
        }
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for BatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl From<mongodb::error::Error> for BatchError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for BatchError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Serialization(format!("BSON error: {}", err))
    }
}

/// Result type alias for batch operations
pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_names_every_failure() {
        let cause = BatchError::Storage("write conflict".into());
        let err = BatchError::Aggregate {
            buffer: "views".into(),
            failures: vec![
                FlushFailure::new("view-a-p1", 1, &cause),
                FlushFailure::new("view-b-p2", 1, &cause),
            ],
        };

        let rendered = err.to_string();
        assert!(rendered.starts_with("2 buffered write(s) failed in 'views'"));
        assert!(rendered.contains("view-a-p1"));
        assert!(rendered.contains("view-b-p2"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn test_handler_not_found_message() {
        let err = BatchError::HandlerNotFound {
            collection: "votes".into(),
            kind: OperationKind::Update,
        };
        assert_eq!(err.to_string(), "No handler registered for update on 'votes'");
        assert!(err.failures().is_empty());
    }
}
