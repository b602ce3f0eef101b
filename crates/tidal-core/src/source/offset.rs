//! Consumed vs committed offset tracking per partition.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Tracks how far each partition has been read and how far it is durably
/// committed, for lag reporting.
pub struct OffsetTracker {
    /// Last consumed offset per partition
    consumed: DashMap<i32, AtomicI64>,

    /// Last committed offset per partition
    committed: DashMap<i32, AtomicI64>,
}

impl OffsetTracker {
    /// Create a new offset tracker.
    pub fn new() -> Self {
        Self {
            consumed: DashMap::new(),
            committed: DashMap::new(),
        }
    }

    /// Seed committed offsets restored from a checkpoint.
    pub fn restore(&self, offsets: &BTreeMap<i32, i64>) {
        for (&partition, &offset) in offsets {
            self.mark_committed(partition, offset);
            self.update_consumed(partition, offset);
        }
    }

    /// Record that `offset` was read from `partition`.
    pub fn update_consumed(&self, partition: i32, offset: i64) {
        self.consumed
            .entry(partition)
            .and_modify(|v| {
                v.fetch_max(offset, Ordering::SeqCst);
            })
            .or_insert_with(|| AtomicI64::new(offset));
    }

    /// Get the last consumed offset for a partition.
    pub fn get_consumed(&self, partition: i32) -> Option<i64> {
        self.consumed
            .get(&partition)
            .map(|v| v.load(Ordering::SeqCst))
    }

    /// Mark an offset as committed.
    pub fn mark_committed(&self, partition: i32, offset: i64) {
        self.committed
            .entry(partition)
            .and_modify(|v| {
                v.fetch_max(offset, Ordering::SeqCst);
            })
            .or_insert_with(|| AtomicI64::new(offset));
    }

    /// Get the committed offset for a partition.
    pub fn get_committed(&self, partition: i32) -> Option<i64> {
        self.committed
            .get(&partition)
            .map(|v| v.load(Ordering::SeqCst))
    }

    /// Consumed but not yet committed messages in a partition.
    pub fn get_lag(&self, partition: i32) -> Option<i64> {
        let consumed = self.get_consumed(partition)?;
        match self.get_committed(partition) {
            Some(committed) => Some(consumed - committed),
            None => Some(consumed + 1),
        }
    }

    /// Total uncommitted messages across all partitions.
    pub fn total_lag(&self) -> i64 {
        self.consumed
            .iter()
            .filter_map(|entry| self.get_lag(*entry.key()))
            .sum()
    }

    /// Get all tracked partitions, sorted.
    pub fn partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.consumed.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}
