//! Stream sources.
//!
//! A [`StreamSource`] yields raw messages with their positions. Sources never
//! own positions across restarts: the driver seeks them to the positions the
//! checkpoint coordinator restores, and the source reads strictly after.

mod file;
mod kafka;
mod memory;
mod offset;

pub use file::FileSource;
pub use kafka::KafkaSource;
pub use memory::{MemorySource, MemorySourceHandle};
pub use offset::OffsetTracker;

use crate::config::StartPolicy;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Position of a message in the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl SourcePosition {
    /// Create a new position.
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// A raw message with all metadata.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    /// Message key (optional)
    pub key: Option<Vec<u8>>,

    /// Message payload (optional)
    pub payload: Option<Vec<u8>>,

    /// Where the message was read from
    pub position: SourcePosition,

    /// Broker timestamp (milliseconds since epoch)
    pub timestamp_ms: Option<i64>,
}

impl SourceMessage {
    /// Get the message key as a string.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_ref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Broker timestamp as a UTC datetime.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp_ms.and_then(DateTime::from_timestamp_millis)
    }

    /// Estimated size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self.payload.as_ref().map(|v| v.len()).unwrap_or(0)
            + self.position.topic.len()
            + 20
    }
}

/// Where a source starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPositions {
    /// Earliest retained offset of every partition
    Earliest,
    /// End of every partition
    Latest,
    /// Next offset to read per partition; unlisted partitions start at earliest
    Offsets(BTreeMap<i32, i64>),
}

impl StartPositions {
    /// Resolve a start policy against the positions restored from a checkpoint.
    ///
    /// Resuming without a checkpoint falls back to the earliest offsets.
    pub fn resolve(policy: StartPolicy, resume: Option<BTreeMap<i32, i64>>) -> Self {
        match policy {
            StartPolicy::Earliest => StartPositions::Earliest,
            StartPolicy::Latest => StartPositions::Latest,
            StartPolicy::ResumeFromCheckpoint => match resume {
                Some(offsets) if !offsets.is_empty() => StartPositions::Offsets(offsets),
                _ => StartPositions::Earliest,
            },
        }
    }
}

/// A source of raw messages.
#[async_trait]
pub trait StreamSource: Send {
    /// Human-readable source description for logs.
    fn describe(&self) -> String;

    /// Position the source. Requests below the earliest retained offset
    /// either fail with `SourceError::DataLoss` or skip ahead with a warning,
    /// depending on the source's data-loss policy.
    async fn seek(&mut self, start: &StartPositions) -> Result<()>;

    /// Read up to `max` messages, waiting at most `timeout` for the first.
    ///
    /// Must be cancel-safe. If the future is dropped before it completes,
    /// messages it already took from the underlying stream are kept by the
    /// source and returned first by the next call.
    async fn poll_batch(&mut self, max: usize, timeout: Duration) -> Result<Vec<SourceMessage>>;

    /// Whether a bounded source has nothing left to read. Always false for
    /// unbounded sources.
    fn is_exhausted(&self) -> bool;

    /// Release the source's resources.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_start_positions() {
        assert_eq!(
            StartPositions::resolve(StartPolicy::Latest, None),
            StartPositions::Latest
        );
        assert_eq!(
            StartPositions::resolve(StartPolicy::ResumeFromCheckpoint, None),
            StartPositions::Earliest
        );

        let offsets = BTreeMap::from([(0, 42)]);
        assert_eq!(
            StartPositions::resolve(StartPolicy::ResumeFromCheckpoint, Some(offsets.clone())),
            StartPositions::Offsets(offsets.clone())
        );
        assert_eq!(
            StartPositions::resolve(StartPolicy::Earliest, Some(offsets)),
            StartPositions::Earliest
        );
    }

    #[test]
    fn test_message_accessors() {
        let msg = SourceMessage {
            key: Some(b"key".to_vec()),
            payload: Some(b"{}".to_vec()),
            position: SourcePosition::new("events", 0, 7),
            timestamp_ms: Some(1_700_000_000_000),
        };
        assert_eq!(msg.key_str(), Some("key"));
        assert!(msg.timestamp().is_some());
        assert!(msg.size_bytes() > 0);
        assert_eq!(msg.position.to_string(), "events/0@7");
    }
}
