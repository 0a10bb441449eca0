//! Error types for the trace-offline engine.

use crate::{CollectionName, RecordId};
use thiserror::Error;

/// All possible errors from the engine internals.
///
/// Public collaborator-facing operations never return these directly; they
/// are downgraded to result values at the persistence and store boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(CollectionName),

    #[error("record is missing a string id")]
    MissingId,

    #[error("corrupt record {id} in {collection}: {reason}")]
    CorruptRecord {
        collection: CollectionName,
        id: RecordId,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    // Validation errors
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownCollection("crops".into());
        assert_eq!(err.to_string(), "unknown collection: crops");

        let err = Error::CorruptRecord {
            collection: "traces".into(),
            id: "trace_1".into(),
            reason: "expected object".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt record trace_1 in traces: expected object"
        );

        let err = Error::InvalidKey("a..b".into());
        assert_eq!(err.to_string(), "invalid key: \"a..b\"");
    }

    #[test]
    fn json_errors_convert() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
