//! Durable checkpoint storage.

use crate::{CheckpointError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Last durably committed position of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Pipeline name
    pub pipeline: String,
    /// Source topic
    pub topic: String,
    /// Last committed offset per partition
    pub offsets: BTreeMap<i32, i64>,
    /// Id of the last batch reflected in the table
    pub last_committed_batch_id: u64,
    /// Table version that batch is reflected in
    pub table_version: u64,
    pub committed_at: DateTime<Utc>,
}

/// Key-value storage for checkpoints, keyed by pipeline name.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Load the checkpoint of `pipeline`, `None` when there is none yet.
    async fn load(&self, pipeline: &str) -> Result<Option<Checkpoint>>;

    /// Replace the checkpoint of `checkpoint.pipeline`.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// One JSON file per pipeline, replaced atomically by write-then-rename.
pub struct FileOffsetStore {
    dir: PathBuf,
}

impl FileOffsetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a pipeline's checkpoint file.
    pub fn path(&self, pipeline: &str) -> PathBuf {
        let file = pipeline.replace(['/', '\\'], "_");
        self.dir.join(format!("{}.json", file))
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self, pipeline: &str) -> Result<Option<Checkpoint>> {
        let path = self.path(pipeline);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::ReadFailed(format!(
                    "{}: {}",
                    path.display(),
                    e
                ))
                .into())
            }
        };

        let checkpoint = serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupted {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let write_failed = |e: std::io::Error| CheckpointError::WriteFailed(e.to_string());

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(write_failed)?;

        let path = self.path(&checkpoint.pipeline);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;

        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_failed)?;
        file.write_all(&json).await.map_err(write_failed)?;
        // Durable before it becomes visible under the real name.
        file.sync_all().await.map_err(write_failed)?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await.map_err(write_failed)?;

        debug!(
            pipeline = %checkpoint.pipeline,
            batch_id = checkpoint.last_committed_batch_id,
            path = %path.display(),
            "Checkpoint saved"
        );
        Ok(())
    }
}

/// In-process checkpoint storage.
#[derive(Default)]
pub struct MemoryOffsetStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self, pipeline: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().get(pipeline).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .lock()
            .insert(checkpoint.pipeline.clone(), checkpoint.clone());
        Ok(())
    }
}
