//! Error types for the tidal core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Per-record failures ([`DecodeError`]) never abort a batch; per-batch
//! failures ([`CommitError`]) abort that batch's commit and checkpoint advance.

use crate::table::SchemaDiff;
use thiserror::Error;

/// Result type alias for tidal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for tidal.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source (stream) error
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Record decode error (only surfaces under the `fail` decode policy)
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Table commit error
    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Table store error that is neither transient nor a conflict
    #[error("Table error: {0}")]
    Table(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether the pipeline must halt on this error instead of retrying.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Commit(e) => !e.is_retryable(),
            Error::Source(SourceError::Timeout(_)) => false,
            Error::Shutdown => false,
            _ => true,
        }
    }
}

/// Stream source errors.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Partition assignment or seek error
    #[error("Partition assignment error: {0}")]
    Assignment(String),

    /// Poll error
    #[error("Poll failed: {0}")]
    Poll(String),

    /// Requested offsets are no longer retained upstream
    #[error("Data loss on {topic}/{partition}: requested offset {requested}, earliest available {earliest}")]
    DataLoss {
        topic: String,
        partition: i32,
        requested: i64,
        earliest: i64,
    },

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Source closed
    #[error("Source closed")]
    Closed,
}

/// Why a raw message could not be decoded into a record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeReason {
    /// Payload was absent or empty
    #[error("empty payload")]
    EmptyPayload,

    /// Payload is not valid UTF-8
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// Payload is not valid JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Payload is JSON but not an object
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// A required field is absent or null
    #[error("missing required field '{0}'")]
    MissingField(String),

    /// A field has the wrong JSON type or an unparseable value
    #[error("field '{field}' expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },
}

/// A per-record decode failure. Counted and dropped under the default policy.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{reason} (raw: {raw_snippet:?})")]
pub struct DecodeError {
    /// What was wrong with the record
    pub reason: DecodeReason,
    /// Leading bytes of the raw payload, for operator context
    pub raw_snippet: String,
}

/// Table commit errors.
#[derive(Error, Debug, Clone)]
pub enum CommitError {
    /// Batch fields are incompatible with the table schema
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(SchemaDiff),

    /// Another writer advanced the table past our base version
    #[error("Concurrent write conflict: base version {base}, current version {current}")]
    ConcurrentWriteConflict { base: u64, current: u64 },

    /// Transient storage failure
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Conflict retries exhausted
    #[error("Commit retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Destructive rebuild requested without opting in
    #[error("Table rebuild refused for {0}: set table.allow_rebuild to permit it")]
    RebuildNotAllowed(String),
}

impl CommitError {
    /// Whether the commit may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommitError::ConcurrentWriteConflict { .. } | CommitError::StorageUnavailable(_)
        )
    }
}

/// Checkpoint errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint could not be read
    #[error("Checkpoint read failed: {0}")]
    ReadFailed(String),

    /// Checkpoint could not be written
    #[error("Checkpoint write failed: {0}")]
    WriteFailed(String),

    /// Stored checkpoint is unreadable
    #[error("Checkpoint corrupted at {path}: {message}")]
    Corrupted { path: String, message: String },

    /// Attempt to move the checkpoint backwards
    #[error("Non-monotonic checkpoint: batch {attempted} is not after committed batch {committed}")]
    NonMonotonic { committed: u64, attempted: u64 },
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(err: arrow::error::ArrowError) -> Self {
        Error::Table(format!("Arrow error: {}", err))
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Error::Table(format!("Parquet error: {}", err))
    }
}

/// Only failures that can clear by themselves are retryable. Network faults,
/// throttling and server errors reach us as `Generic` once the client's own
/// retries are spent; missing objects, bad paths, denied access and
/// misconfiguration never clear and halt the pipeline.
impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::Generic { .. } | object_store::Error::JoinError { .. } => {
                Error::Commit(CommitError::StorageUnavailable(err.to_string()))
            }
            other => Error::Table(format!("Storage error: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let source_err = SourceError::ConnectionFailed {
            broker: "localhost:9092".into(),
            message: "connection refused".into(),
        };
        let err: Error = source_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_object_store_errors_classified() {
        let transient: Error = object_store::Error::Generic {
            store: "S3",
            source: "503 Slow Down".into(),
        }
        .into();
        assert!(matches!(
            transient,
            Error::Commit(CommitError::StorageUnavailable(_))
        ));
        assert!(!transient.is_fatal());

        let missing: Error = object_store::Error::NotFound {
            path: "db/events/data/a.parquet".into(),
            source: "no such object".into(),
        }
        .into();
        assert!(matches!(missing, Error::Table(_)));
        assert!(missing.is_fatal());

        let unsupported: Error = object_store::Error::NotImplemented.into();
        assert!(unsupported.is_fatal());
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError {
            reason: DecodeReason::MissingField("consumption".into()),
            raw_snippet: "{\"uuid\":\"a\"}".into(),
        };
        assert!(err.to_string().contains("missing required field 'consumption'"));
    }

    #[test]
    fn test_commit_error_classification() {
        assert!(CommitError::ConcurrentWriteConflict { base: 1, current: 2 }.is_retryable());
        assert!(CommitError::StorageUnavailable("timeout".into()).is_retryable());
        assert!(!CommitError::SchemaMismatch(SchemaDiff::default()).is_retryable());
        assert!(!CommitError::RetriesExhausted {
            attempts: 3,
            last: "conflict".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        let err: Error = CommitError::SchemaMismatch(SchemaDiff::default()).into();
        assert!(err.is_fatal());

        let err: Error = CommitError::StorageUnavailable("down".into()).into();
        assert!(!err.is_fatal());

        assert!(!Error::Shutdown.is_fatal());
    }

    #[test]
    fn test_checkpoint_error() {
        let err = CheckpointError::NonMonotonic {
            committed: 5,
            attempted: 3,
        };
        assert!(err.to_string().contains("Non-monotonic"));
    }
}
