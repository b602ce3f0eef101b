//! Typed records and their decoder.

mod decoder;

pub use decoder::{DecodeStats, RecordDecoder};

use crate::source::SourcePosition;
use chrono::{DateTime, Utc};

/// A validated record.
///
/// `id` is non-empty and `event_time` is always present: anything that does
/// not satisfy the schema is rejected by the decoder, never coerced.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Unique record identifier
    pub id: String,

    /// When the event happened
    pub event_time: DateTime<Utc>,

    /// Measured value
    pub value: f64,

    /// Partition-key parts, aligned with the configured partition key fields
    pub partition_key_parts: Vec<Option<String>>,

    /// Where the record was read from
    pub source_offset: SourcePosition,

    /// Source message key
    pub source_key: Option<String>,

    /// Source message timestamp
    pub source_timestamp: Option<DateTime<Utc>>,
}

impl Record {
    /// Partition-key part at `index`, if present.
    pub fn key_part(&self, index: usize) -> Option<&str> {
        self.partition_key_parts.get(index).and_then(|p| p.as_deref())
    }
}
