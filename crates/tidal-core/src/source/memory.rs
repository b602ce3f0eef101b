//! In-process stream source.
//!
//! Messages live in per-partition logs shared with a [`MemorySourceHandle`],
//! so tests and embedders can publish while the driver is running. A
//! retention floor models upstream deletion for data-loss handling.

use super::{SourceMessage, SourcePosition, StartPositions, StreamSource};
use crate::{Result, SourceError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of `entries[0]`
    earliest: i64,
    entries: Vec<(Option<Vec<u8>>, Option<Vec<u8>>, Option<i64>)>,
}

impl PartitionLog {
    fn end(&self) -> i64 {
        self.earliest + self.entries.len() as i64
    }
}

#[derive(Debug, Default)]
struct Shared {
    partitions: BTreeMap<i32, PartitionLog>,
}

/// Publishing side of a [`MemorySource`].
#[derive(Clone)]
pub struct MemorySourceHandle {
    topic: String,
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
}

impl MemorySourceHandle {
    /// Append a message to a partition, returning its offset.
    pub fn publish(&self, partition: i32, key: Option<&str>, payload: impl Into<Vec<u8>>) -> i64 {
        self.publish_raw(partition, key.map(|k| k.as_bytes().to_vec()), Some(payload.into()), None)
    }

    /// Append a message with explicit optional fields.
    pub fn publish_raw(
        &self,
        partition: i32,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp_ms: Option<i64>,
    ) -> i64 {
        let offset = {
            let mut shared = self.shared.lock();
            let log = shared.partitions.entry(partition).or_default();
            let offset = log.end();
            log.entries.push((key, payload, timestamp_ms));
            offset
        };
        self.notify.notify_one();
        offset
    }

    /// Delete every message below `offset` in a partition, as upstream
    /// retention would.
    pub fn truncate_before(&self, partition: i32, offset: i64) {
        let mut shared = self.shared.lock();
        let log = shared.partitions.entry(partition).or_default();
        if offset <= log.earliest {
            return;
        }
        let drop = ((offset - log.earliest) as usize).min(log.entries.len());
        log.entries.drain(..drop);
        log.earliest = offset;
    }

    /// Topic the handle publishes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// An in-memory source, bounded or unbounded.
pub struct MemorySource {
    handle: MemorySourceHandle,
    /// Next offset to read per partition
    cursors: BTreeMap<i32, i64>,
    bounded: bool,
    fail_on_data_loss: bool,
    closed: bool,
}

impl MemorySource {
    /// Create an unbounded source; it never reports exhaustion.
    pub fn unbounded(topic: impl Into<String>) -> Self {
        Self::new(topic.into(), false)
    }

    /// Create a bounded source; it is exhausted once every partition is read.
    pub fn bounded(topic: impl Into<String>) -> Self {
        Self::new(topic.into(), true)
    }

    fn new(topic: String, bounded: bool) -> Self {
        Self {
            handle: MemorySourceHandle {
                topic,
                shared: Arc::new(Mutex::new(Shared::default())),
                notify: Arc::new(Notify::new()),
            },
            cursors: BTreeMap::new(),
            bounded,
            fail_on_data_loss: false,
            closed: false,
        }
    }

    /// Fail seeks below the retention floor instead of skipping ahead.
    pub fn with_fail_on_data_loss(mut self, fail: bool) -> Self {
        self.fail_on_data_loss = fail;
        self
    }

    /// Publishing handle sharing this source's logs.
    pub fn handle(&self) -> MemorySourceHandle {
        self.handle.clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn drain_available(&mut self, max: usize) -> Vec<SourceMessage> {
        let shared = self.handle.shared.lock();
        let mut out = Vec::new();

        for (&partition, log) in &shared.partitions {
            if out.len() >= max {
                break;
            }
            let cursor = self.cursors.entry(partition).or_insert(log.earliest);
            // Retention moved past us while running.
            if *cursor < log.earliest {
                warn!(
                    partition = partition,
                    requested = *cursor,
                    earliest = log.earliest,
                    "Messages deleted before they were read, skipping ahead"
                );
                *cursor = log.earliest;
            }
            while *cursor < log.end() && out.len() < max {
                let idx = (*cursor - log.earliest) as usize;
                let (key, payload, timestamp_ms) = &log.entries[idx];
                out.push(SourceMessage {
                    key: key.clone(),
                    payload: payload.clone(),
                    position: SourcePosition::new(&self.handle.topic, partition, *cursor),
                    timestamp_ms: *timestamp_ms,
                });
                *cursor += 1;
            }
        }

        out
    }
}

#[async_trait]
impl StreamSource for MemorySource {
    fn describe(&self) -> String {
        format!("memory://{}", self.handle.topic)
    }

    async fn seek(&mut self, start: &StartPositions) -> Result<()> {
        let shared = self.handle.shared.lock();
        self.cursors.clear();

        for (&partition, log) in &shared.partitions {
            let next = match start {
                StartPositions::Earliest => log.earliest,
                StartPositions::Latest => log.end(),
                StartPositions::Offsets(offsets) => match offsets.get(&partition) {
                    Some(&requested) if requested < log.earliest => {
                        if self.fail_on_data_loss {
                            return Err(SourceError::DataLoss {
                                topic: self.handle.topic.clone(),
                                partition,
                                requested,
                                earliest: log.earliest,
                            }
                            .into());
                        }
                        warn!(
                            topic = %self.handle.topic,
                            partition = partition,
                            requested = requested,
                            earliest = log.earliest,
                            "Requested offset no longer retained, skipping ahead"
                        );
                        log.earliest
                    }
                    Some(&requested) => requested,
                    None => log.earliest,
                },
            };
            self.cursors.insert(partition, next);
        }

        debug!(topic = %self.handle.topic, cursors = ?self.cursors, "Memory source positioned");
        Ok(())
    }

    async fn poll_batch(&mut self, max: usize, timeout: Duration) -> Result<Vec<SourceMessage>> {
        if self.closed {
            return Err(SourceError::Closed.into());
        }

        let batch = self.drain_available(max);
        if !batch.is_empty() || self.bounded {
            return Ok(batch);
        }

        let notify = self.handle.notify.clone();
        let _ = tokio::time::timeout(timeout, notify.notified()).await;
        Ok(self.drain_available(max))
    }

    fn is_exhausted(&self) -> bool {
        if !self.bounded {
            return false;
        }
        let shared = self.handle.shared.lock();
        shared.partitions.iter().all(|(partition, log)| {
            self.cursors
                .get(partition)
                .map_or(log.entries.is_empty(), |&cursor| cursor >= log.end())
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_source_reads_everything() {
        let mut source = MemorySource::bounded("events");
        let handle = source.handle();
        for i in 0..5 {
            handle.publish(0, None, format!("{{\"n\":{}}}", i));
        }
        handle.publish(1, Some("k"), "{}");

        source.seek(&StartPositions::Earliest).await.unwrap();
        assert!(!source.is_exhausted());

        let first = source.poll_batch(4, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 4);
        let rest = source.poll_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].position, SourcePosition::new("events", 1, 0));
        assert!(source.is_exhausted());
    }

    #[tokio::test]
    async fn test_seek_to_offsets() {
        let mut source = MemorySource::bounded("events");
        let handle = source.handle();
        for _ in 0..5 {
            handle.publish(0, None, "{}");
        }

        source
            .seek(&StartPositions::Offsets(BTreeMap::from([(0, 3)])))
            .await
            .unwrap();
        let batch = source.poll_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.iter().map(|m| m.position.offset).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_seek_latest_skips_existing() {
        let mut source = MemorySource::bounded("events");
        source.handle().publish(0, None, "{}");
        source.seek(&StartPositions::Latest).await.unwrap();
        assert!(source.is_exhausted());
    }

    #[tokio::test]
    async fn test_data_loss_skips_ahead_by_default() {
        let mut source = MemorySource::bounded("events");
        let handle = source.handle();
        for _ in 0..10 {
            handle.publish(0, None, "{}");
        }
        handle.truncate_before(0, 6);

        source
            .seek(&StartPositions::Offsets(BTreeMap::from([(0, 2)])))
            .await
            .unwrap();
        let batch = source.poll_batch(100, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.first().map(|m| m.position.offset), Some(6));
        assert_eq!(batch.len(), 4);
    }

    #[tokio::test]
    async fn test_data_loss_fails_when_configured() {
        let mut source = MemorySource::bounded("events").with_fail_on_data_loss(true);
        let handle = source.handle();
        for _ in 0..10 {
            handle.publish(0, None, "{}");
        }
        handle.truncate_before(0, 6);

        let err = source
            .seek(&StartPositions::Offsets(BTreeMap::from([(0, 2)])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Source(SourceError::DataLoss {
                requested: 2,
                earliest: 6,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unbounded_wakes_on_publish() {
        let mut source = MemorySource::unbounded("events");
        let handle = source.handle();
        source.seek(&StartPositions::Earliest).await.unwrap();

        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.publish(0, None, "{}");
        });

        let batch = source.poll_batch(10, Duration::from_secs(5)).await.unwrap();
        publisher.await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!source.is_exhausted());
    }

    #[tokio::test]
    async fn test_closed_source_rejects_poll() {
        let mut source = MemorySource::bounded("events");
        source.close().await.unwrap();
        assert!(source.is_closed());
        assert!(source.poll_batch(1, Duration::ZERO).await.is_err());
    }
}
