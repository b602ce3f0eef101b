//! Versioned table storage on an object store.
//!
//! ## Layout
//!
//! ```text
//! <warehouse>/<namespace>/<table>/
//!   metadata/v1.metadata.json
//!   metadata/v2.metadata.json
//!   data/date=2024-03-01/00000000000000000007-<uuid>.parquet
//! ```
//!
//! The current version is the highest metadata file present. A commit
//! writes `v{base+1}` with create-only semantics, so of two writers racing
//! from the same base exactly one wins and the other sees
//! `ConcurrentWriteConflict`. Within one process commits to the same table
//! are additionally serialized by a per-table mutex.

use super::snapshot::{
    Operation, SnapshotSummary, TableCommit, TableIdent, TableSnapshot, FORMAT_VERSION,
};
use super::schema::TableSchema;
use crate::config::TableConfig;
use crate::{CommitError, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Operations the table writer and reader need from storage.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create a table at version 1. Fails with `ConcurrentWriteConflict` if
    /// it already exists.
    async fn create_table(
        &self,
        ident: &TableIdent,
        schema: &TableSchema,
        properties: BTreeMap<String, String>,
    ) -> Result<TableSnapshot>;

    /// Delete every metadata and data object of a table.
    async fn drop_table(&self, ident: &TableIdent) -> Result<()>;

    /// Whether any version of the table exists.
    async fn table_exists(&self, ident: &TableIdent) -> Result<bool> {
        Ok(self.current_version(ident).await?.is_some())
    }

    /// Latest committed version, `None` when the table does not exist.
    async fn current_version(&self, ident: &TableIdent) -> Result<Option<u64>>;

    /// Load the snapshot of one version.
    async fn load_snapshot(&self, ident: &TableIdent, version: u64) -> Result<TableSnapshot>;

    /// Apply `commit` on top of `base_version`, producing version `base + 1`.
    async fn append_commit(
        &self,
        ident: &TableIdent,
        commit: TableCommit,
        base_version: u64,
    ) -> Result<TableSnapshot>;

    /// Write a data file at a path relative to the table location.
    async fn write_data_file(&self, ident: &TableIdent, path: &str, data: Bytes) -> Result<()>;

    /// Read a data file at a path relative to the table location.
    async fn read_data_file(&self, ident: &TableIdent, path: &str) -> Result<Bytes>;

    /// Versions whose metadata is still retained, ascending.
    async fn list_versions(&self, ident: &TableIdent) -> Result<Vec<u64>>;
}

/// [`TableStore`] over any `object_store` backend.
pub struct ObjectTableStore {
    store: Arc<dyn ObjectStore>,
    /// Prefix under which namespaces live
    root: String,
    /// Per-table commit serialization
    locks: DashMap<TableIdent, Arc<Mutex<()>>>,
}

impl ObjectTableStore {
    /// Wrap an object store; tables live under `root`.
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into().trim_matches('/').to_string(),
            locks: DashMap::new(),
        }
    }

    /// In-memory store, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), "")
    }

    /// Build the store for a warehouse path: `s3://bucket/prefix`,
    /// `memory://`, or a local directory.
    pub fn from_config(config: &TableConfig) -> Result<Self> {
        let warehouse = config.warehouse_path.as_str();

        if let Some(rest) = warehouse.strip_prefix("s3://") {
            use object_store::aws::AmazonS3Builder;

            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::Config(format!("Invalid S3 warehouse path: {}", warehouse)));
            }

            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(ref region) = config.aws_region {
                builder = builder.with_region(region);
            }
            if let Some(ref endpoint) = config.s3_endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            let store = builder
                .build()
                .map_err(|e| Error::Config(format!("Failed to build S3 store: {}", e)))?;
            return Ok(Self::new(Arc::new(store), prefix));
        }

        if warehouse.starts_with("memory://") {
            return Ok(Self::in_memory());
        }

        use object_store::local::LocalFileSystem;

        let path = std::path::Path::new(warehouse);
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| {
                Error::Config(format!(
                    "Failed to create local warehouse directory {}: {}",
                    warehouse, e
                ))
            })?;
        }
        let store = LocalFileSystem::new_with_prefix(path).map_err(|e| {
            Error::Config(format!("Failed to open local warehouse {}: {}", warehouse, e))
        })?;
        Ok(Self::new(Arc::new(store), ""))
    }

    fn table_prefix(&self, ident: &TableIdent) -> String {
        if self.root.is_empty() {
            ident.location()
        } else {
            format!("{}/{}", self.root, ident.location())
        }
    }

    fn table_path(&self, ident: &TableIdent, relative: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", self.table_prefix(ident), relative))
    }

    fn metadata_file(version: u64) -> String {
        format!("metadata/v{}.metadata.json", version)
    }

    fn parse_version(location: &ObjectPath) -> Option<u64> {
        location
            .filename()?
            .strip_prefix('v')?
            .strip_suffix(".metadata.json")?
            .parse()
            .ok()
    }

    fn lock_for(&self, ident: &TableIdent) -> Arc<Mutex<()>> {
        self.locks
            .entry(ident.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write a metadata file only if it does not exist yet.
    async fn put_metadata(&self, ident: &TableIdent, snapshot: &TableSnapshot) -> Result<()> {
        let path = self.table_path(ident, &Self::metadata_file(snapshot.version));
        let body = serde_json::to_vec_pretty(snapshot)?;
        let conflict = || {
            Error::Commit(CommitError::ConcurrentWriteConflict {
                base: snapshot.version.saturating_sub(1),
                current: snapshot.version,
            })
        };

        let opts = PutOptions::from(PutMode::Create);
        match self
            .store
            .put_opts(&path, PutPayload::from(body.clone()), opts)
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => Err(conflict()),
            Err(object_store::Error::NotImplemented) => {
                // Backend without conditional puts; the table mutex still
                // serializes writers in this process.
                match self.store.head(&path).await {
                    Ok(_) => Err(conflict()),
                    Err(object_store::Error::NotFound { .. }) => {
                        self.store.put(&path, PutPayload::from(body)).await?;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete metadata files older than the snapshot's retention window.
    async fn expire_metadata(&self, ident: &TableIdent, snapshot: &TableSnapshot) {
        if !snapshot.delete_after_commit() {
            return;
        }
        let Some(keep_previous) = snapshot.previous_versions_max() else {
            return;
        };
        let oldest_kept = snapshot.version.saturating_sub(keep_previous as u64);

        let versions = match self.list_versions(ident).await {
            Ok(versions) => versions,
            Err(e) => {
                warn!(table = %ident, error = %e, "Failed to list metadata for expiration");
                return;
            }
        };

        for version in versions.into_iter().filter(|&v| v < oldest_kept) {
            let path = self.table_path(ident, &Self::metadata_file(version));
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                    debug!(table = %ident, version = version, "Expired metadata version");
                }
                Err(e) => {
                    warn!(table = %ident, version = version, error = %e, "Failed to expire metadata");
                }
            }
        }
    }
}

#[async_trait]
impl TableStore for ObjectTableStore {
    async fn create_table(
        &self,
        ident: &TableIdent,
        schema: &TableSchema,
        properties: BTreeMap<String, String>,
    ) -> Result<TableSnapshot> {
        let lock = self.lock_for(ident);
        let _guard = lock.lock().await;

        if let Some(current) = self.current_version(ident).await? {
            return Err(CommitError::ConcurrentWriteConflict { base: 0, current }.into());
        }

        let snapshot = TableSnapshot {
            format_version: FORMAT_VERSION,
            table_uuid: uuid::Uuid::new_v4(),
            version: 1,
            parent_version: None,
            schema: schema.clone(),
            properties,
            data_files: Vec::new(),
            metadata_files: Vec::new(),
            timestamp: Utc::now(),
            summary: SnapshotSummary {
                operation: Operation::Create,
                batch_id: None,
                added_records: 0,
                removed_records: 0,
                total_records: 0,
                added_files: 0,
                removed_files: 0,
                watermarks: BTreeMap::new(),
            },
        };

        self.put_metadata(ident, &snapshot).await?;
        info!(table = %ident, fields = schema.fields.len(), "Created table");
        Ok(snapshot)
    }

    async fn drop_table(&self, ident: &TableIdent) -> Result<()> {
        let lock = self.lock_for(ident);
        let _guard = lock.lock().await;

        let prefix = ObjectPath::from(self.table_prefix(ident));
        let objects: Vec<ObjectPath> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;

        for location in &objects {
            match self.store.delete(location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(table = %ident, objects = objects.len(), "Dropped table");
        Ok(())
    }

    async fn current_version(&self, ident: &TableIdent) -> Result<Option<u64>> {
        Ok(self.list_versions(ident).await?.last().copied())
    }

    async fn load_snapshot(&self, ident: &TableIdent, version: u64) -> Result<TableSnapshot> {
        let path = self.table_path(ident, &Self::metadata_file(version));
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(CommitError::TableNotFound(format!("{} v{}", ident, version)).into());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::Table(format!(
                "Corrupted metadata {}: {}",
                Self::metadata_file(version),
                e
            ))
        })
    }

    async fn append_commit(
        &self,
        ident: &TableIdent,
        commit: TableCommit,
        base_version: u64,
    ) -> Result<TableSnapshot> {
        let lock = self.lock_for(ident);
        let _guard = lock.lock().await;

        let current = self
            .current_version(ident)
            .await?
            .ok_or_else(|| CommitError::TableNotFound(ident.to_string()))?;
        if current != base_version {
            return Err(CommitError::ConcurrentWriteConflict {
                base: base_version,
                current,
            }
            .into());
        }

        let base = self.load_snapshot(ident, base_version).await?;
        let removed: HashSet<&str> = commit.removed_files.iter().map(String::as_str).collect();

        let mut data_files: Vec<_> = base
            .data_files
            .iter()
            .filter(|f| !removed.contains(f.path.as_str()))
            .cloned()
            .collect();
        data_files.extend(commit.added_files.iter().cloned());

        let mut watermarks = base.summary.watermarks.clone();
        for (key, &offset) in &commit.watermarks {
            watermarks
                .entry(key.clone())
                .and_modify(|w| *w = (*w).max(offset))
                .or_insert(offset);
        }

        let keep_previous = base.previous_versions_max().unwrap_or(usize::MAX);
        let mut metadata_files = base.metadata_files.clone();
        metadata_files.push(Self::metadata_file(base.version));
        if metadata_files.len() > keep_previous {
            let excess = metadata_files.len() - keep_previous;
            metadata_files.drain(..excess);
        }

        let total_records = data_files.iter().map(|f| f.record_count).sum();
        let snapshot = TableSnapshot {
            format_version: base.format_version,
            table_uuid: base.table_uuid,
            version: base_version + 1,
            parent_version: Some(base_version),
            schema: commit.schema.clone().unwrap_or_else(|| base.schema.clone()),
            properties: base.properties.clone(),
            data_files,
            metadata_files,
            timestamp: Utc::now(),
            summary: SnapshotSummary {
                operation: commit.operation,
                batch_id: commit.batch_id,
                added_records: commit.added_records(),
                removed_records: commit.removed_records,
                total_records,
                added_files: commit.added_files.len(),
                removed_files: commit.removed_files.len(),
                watermarks,
            },
        };

        self.put_metadata(ident, &snapshot).await?;
        self.expire_metadata(ident, &snapshot).await;

        debug!(
            table = %ident,
            version = snapshot.version,
            added_files = snapshot.summary.added_files,
            total_records = total_records,
            "Committed table version"
        );
        Ok(snapshot)
    }

    async fn write_data_file(&self, ident: &TableIdent, path: &str, data: Bytes) -> Result<()> {
        let location = self.table_path(ident, path);
        self.store.put(&location, PutPayload::from_bytes(data)).await?;
        Ok(())
    }

    async fn read_data_file(&self, ident: &TableIdent, path: &str) -> Result<Bytes> {
        let location = self.table_path(ident, path);
        Ok(self.store.get(&location).await?.bytes().await?)
    }

    async fn list_versions(&self, ident: &TableIdent) -> Result<Vec<u64>> {
        let prefix = self.table_path(ident, "metadata");
        let mut versions: Vec<u64> = self
            .store
            .list(Some(&prefix))
            .try_filter_map(|meta| async move { Ok(Self::parse_version(&meta.location)) })
            .try_collect()
            .await?;
        versions.sort_unstable();
        Ok(versions)
    }
}
