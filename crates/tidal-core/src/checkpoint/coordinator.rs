//! Checkpoint coordination.
//!
//! The checkpoint only ever moves forward, and only for a batch the table
//! writer has confirmed with a [`CommitReceipt`]. A crash between the table
//! commit and `advance` leaves the checkpoint one batch behind; on restart
//! that batch is read again and the writer recognizes it as a replay.

use super::offset_store::{Checkpoint, OffsetStore};
use crate::table::CommitReceipt;
use crate::{CheckpointError, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Ties batch commits to source offset advancement for one pipeline.
pub struct CheckpointCoordinator {
    store: Arc<dyn OffsetStore>,
    pipeline: String,
    current: Option<Checkpoint>,
}

impl CheckpointCoordinator {
    /// Load the pipeline's last checkpoint.
    pub async fn open(store: Arc<dyn OffsetStore>, pipeline: impl Into<String>) -> Result<Self> {
        let pipeline = pipeline.into();
        let current = store.load(&pipeline).await?;

        match current {
            Some(ref checkpoint) => info!(
                pipeline = %pipeline,
                batch_id = checkpoint.last_committed_batch_id,
                table_version = checkpoint.table_version,
                offsets = ?checkpoint.offsets,
                "Restored checkpoint"
            ),
            None => info!(pipeline = %pipeline, "No checkpoint, starting fresh"),
        }

        Ok(Self {
            store,
            pipeline,
            current,
        })
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// The last persisted checkpoint.
    pub fn current(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }

    /// Next offset to read per partition.
    pub fn resume_positions(&self) -> Option<BTreeMap<i32, i64>> {
        self.current.as_ref().map(|c| {
            c.offsets
                .iter()
                .map(|(&partition, &offset)| (partition, offset + 1))
                .collect()
        })
    }

    /// Id for the next batch.
    pub fn next_batch_id(&self) -> u64 {
        self.current
            .as_ref()
            .map_or(0, |c| c.last_committed_batch_id + 1)
    }

    /// Persist that the receipt's batch is durably in the table.
    pub async fn advance(&mut self, receipt: &CommitReceipt) -> Result<&Checkpoint> {
        let mut offsets = BTreeMap::new();
        let mut topic = receipt.offset_range().topic.clone();

        if let Some(ref current) = self.current {
            if receipt.batch_id() <= current.last_committed_batch_id {
                return Err(CheckpointError::NonMonotonic {
                    committed: current.last_committed_batch_id,
                    attempted: receipt.batch_id(),
                }
                .into());
            }
            offsets = current.offsets.clone();
            if topic.is_empty() {
                topic = current.topic.clone();
            }
        }

        for (partition, last) in receipt.offset_range().last_offsets() {
            offsets
                .entry(partition)
                .and_modify(|o: &mut i64| *o = (*o).max(last))
                .or_insert(last);
        }

        let checkpoint = Checkpoint {
            pipeline: self.pipeline.clone(),
            topic,
            offsets,
            last_committed_batch_id: receipt.batch_id(),
            table_version: receipt.table_version(),
            committed_at: Utc::now(),
        };
        self.store.save(&checkpoint).await?;

        debug!(
            pipeline = %self.pipeline,
            batch_id = checkpoint.last_committed_batch_id,
            table_version = checkpoint.table_version,
            "Checkpoint advanced"
        );
        Ok(self.current.insert(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OffsetRange;
    use crate::checkpoint::MemoryOffsetStore;
    use crate::source::SourcePosition;
    use crate::table::schema::TableSchema;
    use crate::table::snapshot::{Operation, SnapshotSummary, TableSnapshot, FORMAT_VERSION};
    use crate::Error;

    fn receipt(batch_id: u64, offsets: &[(i32, i64)], version: u64) -> CommitReceipt {
        let mut range = OffsetRange::default();
        for &(partition, offset) in offsets {
            range.include(&SourcePosition::new("iot", partition, offset));
        }
        let snapshot = TableSnapshot {
            format_version: FORMAT_VERSION,
            table_uuid: uuid::Uuid::new_v4(),
            version,
            parent_version: None,
            schema: TableSchema::new([("id", crate::table::FieldType::String, true)]),
            properties: BTreeMap::new(),
            data_files: vec![],
            metadata_files: vec![],
            timestamp: Utc::now(),
            summary: SnapshotSummary {
                operation: Operation::Append,
                batch_id: Some(batch_id),
                added_records: 0,
                removed_records: 0,
                total_records: 0,
                added_files: 0,
                removed_files: 0,
                watermarks: BTreeMap::new(),
            },
        };
        CommitReceipt::new(batch_id, range, snapshot, false, 1, 0)
    }

    #[tokio::test]
    async fn test_fresh_pipeline() {
        let store = Arc::new(MemoryOffsetStore::new());
        let coordinator = CheckpointCoordinator::open(store, "iot").await.unwrap();
        assert!(coordinator.current().is_none());
        assert!(coordinator.resume_positions().is_none());
        assert_eq!(coordinator.next_batch_id(), 0);
    }

    #[tokio::test]
    async fn test_advance_and_restore() {
        let store = Arc::new(MemoryOffsetStore::new());
        let mut coordinator = CheckpointCoordinator::open(store.clone(), "iot")
            .await
            .unwrap();

        coordinator
            .advance(&receipt(0, &[(0, 0), (0, 4), (1, 2)], 2))
            .await
            .unwrap();
        let checkpoint = coordinator
            .advance(&receipt(1, &[(0, 9)], 3))
            .await
            .unwrap();
        assert_eq!(checkpoint.offsets, BTreeMap::from([(0, 9), (1, 2)]));
        assert_eq!(checkpoint.table_version, 3);

        let restored = CheckpointCoordinator::open(store, "iot").await.unwrap();
        assert_eq!(restored.next_batch_id(), 2);
        assert_eq!(
            restored.resume_positions(),
            Some(BTreeMap::from([(0, 10), (1, 3)]))
        );
    }

    #[tokio::test]
    async fn test_rejects_non_monotonic_batch() {
        let store = Arc::new(MemoryOffsetStore::new());
        let mut coordinator = CheckpointCoordinator::open(store.clone(), "iot")
            .await
            .unwrap();
        coordinator.advance(&receipt(5, &[(0, 50)], 7)).await.unwrap();

        let err = coordinator
            .advance(&receipt(5, &[(0, 60)], 8))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Checkpoint(CheckpointError::NonMonotonic {
                committed: 5,
                attempted: 5
            })
        ));

        let stored = store.load("iot").await.unwrap().unwrap();
        assert_eq!(stored.offsets[&0], 50);
    }

    #[tokio::test]
    async fn test_offsets_never_move_backwards() {
        let store = Arc::new(MemoryOffsetStore::new());
        let mut coordinator = CheckpointCoordinator::open(store, "iot").await.unwrap();
        coordinator.advance(&receipt(0, &[(0, 20)], 2)).await.unwrap();

        let checkpoint = coordinator
            .advance(&receipt(1, &[(0, 15)], 3))
            .await
            .unwrap();
        assert_eq!(checkpoint.offsets[&0], 20);
    }
}
