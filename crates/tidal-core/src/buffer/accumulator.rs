//! Micro-batch accumulation.
//!
//! One accumulation buffer per driver. A batch closes when:
//! - `max_records` decoded records are buffered, or
//! - the window has elapsed since the first record of the batch, or
//! - the window has elapsed since the last flush with nothing buffered
//!   (an empty flush, which consumes no batch id).
//!
//! Offsets of dropped messages are tracked alongside decoded ones so the
//! checkpoint moves past them. A window holding only dropped offsets flushes
//! empty; its offsets carry into the next batch.

use super::batch::{Batch, OffsetRange};
use crate::config::BatchConfig;
use crate::record::Record;
use crate::source::SourcePosition;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Result of closing a window.
#[derive(Debug)]
pub enum Flush {
    /// A batch with at least one record
    Batch(Batch),
    /// Nothing to commit
    Empty,
}

/// Buffers decoded records into batches.
pub struct BatchAccumulator {
    interval: Duration,
    max_records: usize,
    records: Vec<Record>,
    offsets: OffsetRange,
    dropped: u64,
    /// When the first record of the current batch arrived
    window_start: Option<Instant>,
    last_flush: Instant,
    next_batch_id: u64,
}

impl BatchAccumulator {
    /// Create an accumulator whose first batch gets `next_batch_id`.
    pub fn new(config: &BatchConfig, next_batch_id: u64) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_seconds),
            max_records: config.max_records,
            records: Vec::new(),
            offsets: OffsetRange::default(),
            dropped: 0,
            window_start: None,
            last_flush: Instant::now(),
            next_batch_id,
        }
    }

    /// Override the window length.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Buffer a decoded record.
    pub fn ingest(&mut self, record: Record) {
        self.offsets.include(&record.source_offset);
        if self.window_start.is_none() {
            self.window_start = Some(Instant::now());
        }
        self.records.push(record);
    }

    /// Account for a message that was dropped.
    pub fn skip(&mut self, position: &SourcePosition) {
        self.offsets.include(position);
        self.dropped += 1;
    }

    /// Whether the current window should close now.
    pub fn should_flush(&self) -> bool {
        self.should_flush_at(Instant::now())
    }

    /// Whether the current window should close at `now`.
    pub fn should_flush_at(&self, now: Instant) -> bool {
        if self.records.len() >= self.max_records {
            return true;
        }
        match self.window_start {
            Some(start) => now.saturating_duration_since(start) >= self.interval,
            None => now.saturating_duration_since(self.last_flush) >= self.interval,
        }
    }

    /// When the current window closes on time: one interval after its first
    /// record, or after the last flush while nothing is buffered.
    pub fn flush_deadline(&self) -> Instant {
        self.window_start.unwrap_or(self.last_flush) + self.interval
    }

    /// Close the current window.
    pub fn flush(&mut self) -> Flush {
        self.last_flush = Instant::now();
        self.window_start = None;

        if self.records.is_empty() {
            debug!(
                pending_offsets = self.offsets.len(),
                "Window closed with no records"
            );
            return Flush::Empty;
        }

        let batch = Batch {
            batch_id: self.next_batch_id,
            records: std::mem::take(&mut self.records),
            offset_range: std::mem::take(&mut self.offsets),
            dropped: std::mem::take(&mut self.dropped),
        };
        self.next_batch_id += 1;

        debug!(
            batch_id = batch.batch_id,
            records = batch.records.len(),
            dropped = batch.dropped,
            offsets = %batch.offset_range,
            "Batch closed"
        );
        Flush::Batch(batch)
    }

    /// Buffered record count.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether any offsets (decoded or dropped) are pending.
    pub fn has_pending_offsets(&self) -> bool {
        !self.offsets.is_empty()
    }

    /// Id the next non-empty batch will get.
    pub fn next_batch_id(&self) -> u64 {
        self.next_batch_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config(max_records: usize) -> BatchConfig {
        BatchConfig {
            interval_seconds: 60,
            max_records,
            ..Default::default()
        }
    }

    fn record(id: &str, offset: i64) -> Record {
        Record {
            id: id.to_string(),
            event_time: Utc::now(),
            value: 1.0,
            partition_key_parts: vec![],
            source_offset: SourcePosition::new("iot", 0, offset),
            source_key: None,
            source_timestamp: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_from_first_record() {
        let mut acc = BatchAccumulator::new(&config(100), 0);
        tokio::time::advance(Duration::from_secs(50)).await;
        acc.ingest(record("a", 0));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!acc.should_flush());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_follows_first_record() {
        let mut acc = BatchAccumulator::new(&config(100), 0);
        let created = Instant::now();
        assert_eq!(acc.flush_deadline(), created + Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(45)).await;
        acc.ingest(record("a", 0));
        assert_eq!(
            acc.flush_deadline(),
            created + Duration::from_secs(105)
        );
        assert!(!acc.should_flush_at(acc.flush_deadline() - Duration::from_millis(1)));
        assert!(acc.should_flush_at(acc.flush_deadline()));
    }

    #[test]
    fn test_size_trigger() {
        let mut acc = BatchAccumulator::new(&config(2), 0);
        acc.ingest(record("a", 0));
        assert!(!acc.should_flush());
        acc.ingest(record("b", 1));
        assert!(acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_flush() {
        let mut acc = BatchAccumulator::new(&config(100), 3);
        assert!(!acc.should_flush());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(acc.should_flush());
        assert!(matches!(acc.flush(), Flush::Empty));
        assert_eq!(acc.next_batch_id(), 3);
        assert!(!acc.should_flush());
    }

    #[test]
    fn test_batch_ids_continue() {
        let mut acc = BatchAccumulator::new(&config(100), 7);
        acc.ingest(record("a", 0));
        let Flush::Batch(first) = acc.flush() else {
            panic!("expected batch");
        };
        assert_eq!(first.batch_id, 7);

        acc.ingest(record("b", 1));
        let Flush::Batch(second) = acc.flush() else {
            panic!("expected batch");
        };
        assert_eq!(second.batch_id, 8);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_dropped_offsets_in_range() {
        let mut acc = BatchAccumulator::new(&config(100), 0);
        acc.ingest(record("a", 0));
        acc.skip(&SourcePosition::new("iot", 0, 1));
        acc.ingest(record("c", 2));

        let Flush::Batch(batch) = acc.flush() else {
            panic!("expected batch");
        };
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.dropped, 1);
        assert_eq!(batch.offset_range.last_offsets()[&0], 2);
        assert_eq!(batch.offset_range.len(), 3);
    }

    #[test]
    fn test_dropped_only_window_carries_offsets() {
        let mut acc = BatchAccumulator::new(&config(100), 0);
        acc.skip(&SourcePosition::new("iot", 0, 0));
        acc.skip(&SourcePosition::new("iot", 0, 1));

        assert!(matches!(acc.flush(), Flush::Empty));
        assert!(acc.has_pending_offsets());

        acc.ingest(record("c", 2));
        let Flush::Batch(batch) = acc.flush() else {
            panic!("expected batch");
        };
        assert_eq!(batch.batch_id, 0);
        assert_eq!(batch.offset_range.spans[&0].first, 0);
        assert_eq!(batch.dropped, 2);
    }
}
