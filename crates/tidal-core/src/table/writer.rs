//! Atomic batch commits.
//!
//! ## Commit Flow
//!
//! 1. Load the current snapshot (creating or rebuilding the table if needed)
//! 2. Negotiate the batch schema against the table schema
//! 3. Drop records already reflected in the table (offset <= watermark)
//! 4. Write Parquet data files, one per partition value
//! 5. In upsert mode, rewrite existing files holding superseded ids
//! 6. Commit a new snapshot on top of the loaded version
//!
//! Concurrent write conflicts restart the flow from step 1 against the new
//! version, up to `max_attempts` times. Storage failures are retried with
//! backoff until `storage_max_attempts` (forever by default), raising an
//! alert once `alert_after` consecutive failures have been seen.

use super::files::{checksum, decode_parquet, encode_parquet};
use super::schema::{columns, negotiate, SchemaCheck, TableSchema};
use super::snapshot::{properties, DataFileRef, Operation, TableCommit, TableIdent, TableSnapshot};
use super::store::TableStore;
use crate::buffer::{records_to_arrow, Batch, OffsetRange};
use crate::config::{SchemaConfig, TableConfig, WriteMode};
use crate::metrics::{ErrorKind, PipelineMetrics};
use crate::record::Record;
use crate::retry::RetryPolicy;
use crate::{CommitError, Error, Result};
use arrow::array::{Array, BooleanArray, StringArray, TimestampMicrosecondArray};
use arrow::compute::{concat_batches, filter_record_batch};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Partition value used for records without one.
pub const DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Proof that a batch is durably reflected in a table snapshot.
///
/// Only the writer constructs receipts, so a checkpoint can only ever be
/// advanced for a commit that actually happened.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    batch_id: u64,
    offset_range: OffsetRange,
    snapshot: TableSnapshot,
    was_replay: bool,
    attempts: u32,
    rows_written: u64,
}

impl CommitReceipt {
    pub(crate) fn new(
        batch_id: u64,
        offset_range: OffsetRange,
        snapshot: TableSnapshot,
        was_replay: bool,
        attempts: u32,
        rows_written: u64,
    ) -> Self {
        Self {
            batch_id,
            offset_range,
            snapshot,
            was_replay,
            attempts,
            rows_written,
        }
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Source offsets the batch consumed.
    pub fn offset_range(&self) -> &OffsetRange {
        &self.offset_range
    }

    /// Snapshot the batch is reflected in.
    pub fn snapshot(&self) -> &TableSnapshot {
        &self.snapshot
    }

    pub fn table_version(&self) -> u64 {
        self.snapshot.version
    }

    /// True when every record was already in the table and nothing was written.
    pub fn was_replay(&self) -> bool {
        self.was_replay
    }

    /// Commit attempts made, including the successful one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

/// Why a commit attempt failed in a way the retry loop handles.
enum RetryReason {
    Conflict { base: u64, current: u64 },
    Storage(String),
}

/// Writes batches into one table.
pub struct TableWriter {
    store: Arc<dyn TableStore>,
    ident: TableIdent,
    config: TableConfig,
    schema: SchemaConfig,
    retry: RetryPolicy,
    /// Set by `rebuild_on_start`; cleared once the first batch rebuilt the table
    rebuild_pending: AtomicBool,
    consecutive_storage_failures: AtomicU32,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl TableWriter {
    /// Create a writer for the table named in `config`.
    pub fn new(
        store: Arc<dyn TableStore>,
        config: TableConfig,
        schema: SchemaConfig,
        retry: RetryPolicy,
    ) -> Self {
        let ident = TableIdent::new(config.namespace.clone(), config.table_name.clone());
        let rebuild_pending = AtomicBool::new(config.rebuild_on_start);
        Self {
            store,
            ident,
            config,
            schema,
            retry,
            rebuild_pending,
            consecutive_storage_failures: AtomicU32::new(0),
            metrics: None,
        }
    }

    /// Attach pipeline metrics.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn ident(&self) -> &TableIdent {
        &self.ident
    }

    pub fn store(&self) -> Arc<dyn TableStore> {
        self.store.clone()
    }

    /// Schema every batch is written with.
    pub fn record_schema(&self) -> TableSchema {
        TableSchema::for_records(&self.schema)
    }

    /// Storage properties recorded when the table is created.
    pub fn table_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::from([
            (properties::WRITE_FORMAT.to_string(), "parquet".to_string()),
            (
                properties::COMPRESSION.to_string(),
                self.config.compression.as_str().to_string(),
            ),
            (
                properties::FORMAT_VERSION.to_string(),
                super::snapshot::FORMAT_VERSION.to_string(),
            ),
            (
                properties::METADATA_DELETE_AFTER_COMMIT.to_string(),
                "true".to_string(),
            ),
            (
                properties::METADATA_PREVIOUS_VERSIONS_MAX.to_string(),
                self.config.retention_count.to_string(),
            ),
        ]);

        let mode = match self.config.write_mode {
            WriteMode::Insert => "insert",
            WriteMode::Upsert => "upsert",
        };
        props.insert(properties::WRITE_MODE.to_string(), mode.to_string());

        if let Some(ref field) = self.config.partition_field {
            props.insert(properties::PARTITION_FIELD.to_string(), field.clone());
        }
        if self.config.write_mode == WriteMode::Upsert {
            props.insert(properties::RECORD_KEY.to_string(), columns::ID.to_string());
            props.insert(
                properties::PRECOMBINE_FIELD.to_string(),
                columns::EVENT_TIME.to_string(),
            );
        }
        props
    }

    /// Latest snapshot, `None` when the table does not exist.
    pub async fn current_snapshot(&self) -> Result<Option<TableSnapshot>> {
        match self.store.current_version(&self.ident).await? {
            Some(version) => Ok(Some(self.store.load_snapshot(&self.ident, version).await?)),
            None => Ok(None),
        }
    }

    /// Create the table if it does not exist. Never drops anything.
    pub async fn ensure_table(&self, schema: &TableSchema) -> Result<TableSnapshot> {
        if let Some(snapshot) = self.current_snapshot().await? {
            return Ok(snapshot);
        }

        match self
            .store
            .create_table(&self.ident, schema, self.table_properties())
            .await
        {
            Ok(snapshot) => {
                info!(
                    table = %self.ident,
                    mode = ?self.config.write_mode,
                    partition_field = ?self.config.partition_field,
                    "Table created"
                );
                Ok(snapshot)
            }
            Err(Error::Commit(CommitError::ConcurrentWriteConflict { .. })) => {
                debug!(table = %self.ident, "Table created concurrently, loading it");
                self.current_snapshot()
                    .await?
                    .ok_or_else(|| CommitError::TableNotFound(self.ident.to_string()).into())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the table and create it empty with `schema`.
    ///
    /// Refused unless `table.allow_rebuild` is set.
    pub async fn rebuild_table(&self, schema: &TableSchema) -> Result<TableSnapshot> {
        if !self.config.allow_rebuild {
            return Err(CommitError::RebuildNotAllowed(self.ident.to_string()).into());
        }

        warn!(table = %self.ident, "Rebuilding table, existing data is discarded");
        self.store.drop_table(&self.ident).await?;
        self.store
            .create_table(&self.ident, schema, self.table_properties())
            .await
    }

    /// Commit a batch atomically: all of its records become visible in one
    /// new snapshot, or none do.
    pub async fn commit(&self, batch: &Batch) -> Result<CommitReceipt> {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut conflicts = 0u32;
        let mut storage_failures = 0u32;

        loop {
            attempts += 1;

            let reason = match self.try_commit(batch, attempts).await {
                Ok(receipt) => {
                    self.consecutive_storage_failures.store(0, Ordering::Relaxed);
                    if let Some(ref metrics) = self.metrics {
                        if receipt.was_replay() {
                            metrics.record_replay();
                        } else {
                            metrics.record_commit(
                                receipt.rows_written(),
                                receipt.table_version(),
                                started.elapsed(),
                            );
                        }
                    }
                    if attempts > 1 {
                        info!(
                            batch_id = batch.batch_id,
                            version = receipt.table_version(),
                            attempts = attempts,
                            "Commit succeeded after retries"
                        );
                    }
                    return Ok(receipt);
                }
                Err(Error::Commit(CommitError::ConcurrentWriteConflict { base, current })) => {
                    RetryReason::Conflict { base, current }
                }
                Err(Error::Commit(CommitError::StorageUnavailable(message))) => {
                    RetryReason::Storage(message)
                }
                Err(e) => {
                    if let (Some(metrics), Error::Commit(CommitError::SchemaMismatch(_))) =
                        (&self.metrics, &e)
                    {
                        metrics.record_error(ErrorKind::Schema);
                    }
                    return Err(e);
                }
            };

            let delay = match reason {
                RetryReason::Conflict { base, current } => {
                    conflicts += 1;
                    self.record_error(ErrorKind::Conflict);
                    if !self.retry.allows_conflict_retry(conflicts) {
                        warn!(
                            batch_id = batch.batch_id,
                            base = base,
                            current = current,
                            attempts = conflicts,
                            "Concurrent write conflict: max retries exceeded"
                        );
                        return Err(CommitError::RetriesExhausted {
                            attempts: conflicts,
                            last: format!(
                                "concurrent write conflict: base {}, current {}",
                                base, current
                            ),
                        }
                        .into());
                    }
                    let delay = self.retry.calculate_delay(conflicts - 1);
                    debug!(
                        batch_id = batch.batch_id,
                        base = base,
                        current = current,
                        retry = conflicts,
                        delay_ms = delay.as_millis() as u64,
                        "Concurrent write conflict, rebasing"
                    );
                    delay
                }
                RetryReason::Storage(message) => {
                    storage_failures += 1;
                    let consecutive =
                        self.consecutive_storage_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    self.record_error(ErrorKind::Storage);

                    if self.retry.should_alert(consecutive) {
                        error!(
                            table = %self.ident,
                            consecutive_failures = consecutive,
                            error = %message,
                            "ALERT: table storage unavailable"
                        );
                        if let Some(ref metrics) = self.metrics {
                            metrics.record_storage_alert();
                        }
                    }

                    if !self.retry.allows_storage_retry(storage_failures) {
                        return Err(CommitError::RetriesExhausted {
                            attempts: storage_failures,
                            last: message,
                        }
                        .into());
                    }
                    let delay = self.retry.calculate_delay(storage_failures - 1);
                    warn!(
                        batch_id = batch.batch_id,
                        retry = storage_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Storage unavailable, retrying commit"
                    );
                    delay
                }
            };

            if let Some(ref metrics) = self.metrics {
                metrics.record_commit_retry();
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn record_error(&self, kind: ErrorKind) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_error(kind);
        }
    }

    /// One commit attempt against the current table version.
    async fn try_commit(&self, batch: &Batch, attempt: u32) -> Result<CommitReceipt> {
        let batch_schema = self.record_schema();

        let base = if self.rebuild_pending.load(Ordering::Acquire) {
            let snapshot = self.rebuild_table(&batch_schema).await?;
            self.rebuild_pending.store(false, Ordering::Release);
            snapshot
        } else {
            self.ensure_table(&batch_schema).await?
        };

        if let SchemaCheck::Mismatch(diff) = negotiate(&base.schema, &batch_schema) {
            error!(
                table = %self.ident,
                batch_id = batch.batch_id,
                diff = %diff,
                "Batch schema is incompatible with the table"
            );
            return Err(CommitError::SchemaMismatch(diff).into());
        }

        let fresh: Vec<&Record> = batch
            .records
            .iter()
            .filter(|r| {
                base.watermark(&r.source_offset.topic, r.source_offset.partition)
                    .map_or(true, |w| r.source_offset.offset > w)
            })
            .collect();

        if fresh.is_empty() {
            info!(
                batch_id = batch.batch_id,
                version = base.version,
                offsets = %batch.offset_range,
                "Batch already reflected in table, skipping write"
            );
            return Ok(CommitReceipt::new(
                batch.batch_id,
                batch.offset_range.clone(),
                base,
                true,
                attempt,
                0,
            ));
        }
        if fresh.len() < batch.records.len() {
            debug!(
                batch_id = batch.batch_id,
                replayed = batch.records.len() - fresh.len(),
                "Filtered records already in table"
            );
        }

        let processing_time = Utc::now();
        let mut commit = match self.config.write_mode {
            WriteMode::Insert => {
                let added_files = self
                    .write_partitioned(&fresh, batch.batch_id, processing_time)
                    .await?;
                TableCommit {
                    operation: Operation::Append,
                    batch_id: Some(batch.batch_id),
                    added_files,
                    removed_files: Vec::new(),
                    removed_records: 0,
                    watermarks: BTreeMap::new(),
                    schema: None,
                }
            }
            WriteMode::Upsert => {
                self.upsert(&base, &fresh, batch.batch_id, processing_time)
                    .await?
            }
        };

        commit.watermarks = batch
            .offset_range
            .last_offsets()
            .into_iter()
            .map(|(p, offset)| {
                (
                    TableSnapshot::watermark_key(&batch.offset_range.topic, p),
                    offset,
                )
            })
            .collect();

        let rows_written = commit.added_records();
        let snapshot = self
            .store
            .append_commit(&self.ident, commit, base.version)
            .await?;

        info!(
            table = %self.ident,
            batch_id = batch.batch_id,
            version = snapshot.version,
            rows = rows_written,
            files = snapshot.summary.added_files,
            total_records = snapshot.summary.total_records,
            "Committed batch"
        );

        Ok(CommitReceipt::new(
            batch.batch_id,
            batch.offset_range.clone(),
            snapshot,
            false,
            attempt,
            rows_written,
        ))
    }

    /// Write `records` as one Parquet file per partition value.
    async fn write_partitioned(
        &self,
        records: &[&Record],
        batch_id: u64,
        processing_time: DateTime<Utc>,
    ) -> Result<Vec<DataFileRef>> {
        let partition_index = self
            .config
            .partition_field
            .as_ref()
            .and_then(|field| self.schema.partition_key_fields.iter().position(|f| f == field));

        let mut groups: BTreeMap<Option<String>, Vec<&Record>> = BTreeMap::new();
        for &record in records {
            let segment = match (&self.config.partition_field, partition_index) {
                (Some(field), Some(index)) => Some(format!(
                    "{}={}",
                    field,
                    record.key_part(index).unwrap_or(DEFAULT_PARTITION)
                )),
                _ => None,
            };
            groups.entry(segment).or_default().push(record);
        }

        let mut files = Vec::with_capacity(groups.len());
        for (partition, group) in groups {
            let arrow_batch = records_to_arrow(&group, &self.schema, batch_id, processing_time)?;
            files.push(self.write_file(&arrow_batch, partition, batch_id).await?);
        }
        Ok(files)
    }

    async fn write_file(
        &self,
        batch: &RecordBatch,
        partition: Option<String>,
        batch_id: u64,
    ) -> Result<DataFileRef> {
        let data = encode_parquet(batch, self.config.compression)?;
        let file_name = format!("{:020}-{}.parquet", batch_id, Uuid::new_v4());
        let path = match partition {
            Some(ref segment) => format!("data/{}/{}", segment, file_name),
            None => format!("data/{}", file_name),
        };

        let file = DataFileRef {
            path,
            record_count: batch.num_rows() as u64,
            size_bytes: data.len() as u64,
            checksum: checksum(&data),
            partition,
            batch_id,
        };
        self.store
            .write_data_file(&self.ident, &file.path, data)
            .await?;

        debug!(
            path = %file.path,
            rows = file.record_count,
            bytes = file.size_bytes,
            "Wrote data file"
        );
        Ok(file)
    }

    /// Copy-on-write upsert keyed by record id, latest event time wins.
    async fn upsert(
        &self,
        base: &TableSnapshot,
        records: &[&Record],
        batch_id: u64,
        processing_time: DateTime<Utc>,
    ) -> Result<TableCommit> {
        let mut latest: HashMap<&str, &Record> = HashMap::new();
        for &record in records {
            latest
                .entry(record.id.as_str())
                .and_modify(|kept| {
                    if precombine_key(record) > precombine_key(kept) {
                        *kept = record;
                    }
                })
                .or_insert(record);
        }

        // Existing rows: per file, the ids it holds and their event times.
        let mut existing_files = Vec::with_capacity(base.data_files.len());
        let mut stored_event_time: HashMap<String, i64> = HashMap::new();
        for file in &base.data_files {
            let batches = decode_parquet(self.store.read_data_file(&self.ident, &file.path).await?)?;
            for rb in &batches {
                let ids = string_column(rb, columns::ID)?;
                let times = timestamp_column(rb, columns::EVENT_TIME)?;
                for row in 0..rb.num_rows() {
                    if ids.is_null(row) {
                        continue;
                    }
                    stored_event_time
                        .entry(ids.value(row).to_string())
                        .and_modify(|t| *t = (*t).max(times.value(row)))
                        .or_insert(times.value(row));
                }
            }
            existing_files.push((file, batches));
        }

        let mut stale = 0usize;
        let mut survivors: Vec<&Record> = latest
            .into_values()
            .filter(|r| match stored_event_time.get(&r.id) {
                Some(&stored) if stored > r.event_time.timestamp_micros() => {
                    stale += 1;
                    false
                }
                _ => true,
            })
            .collect();
        survivors.sort_by_key(|r| (r.source_offset.partition, r.source_offset.offset));
        if stale > 0 {
            debug!(
                batch_id = batch_id,
                stale = stale,
                "Discarded records older than stored rows"
            );
        }

        let superseded: HashSet<&str> = survivors
            .iter()
            .filter(|r| stored_event_time.contains_key(&r.id))
            .map(|r| r.id.as_str())
            .collect();

        let mut removed_files = Vec::new();
        let mut removed_records = 0u64;
        let mut added_files = Vec::new();

        if !superseded.is_empty() {
            for (file, batches) in existing_files {
                let mut kept = Vec::with_capacity(batches.len());
                let mut dropped_rows = 0u64;
                for rb in &batches {
                    let ids = string_column(rb, columns::ID)?;
                    let keep: BooleanArray = (0..rb.num_rows())
                        .map(|row| Some(ids.is_null(row) || !superseded.contains(ids.value(row))))
                        .collect();
                    dropped_rows += keep.false_count() as u64;
                    kept.push(filter_record_batch(rb, &keep)?);
                }
                if dropped_rows == 0 {
                    continue;
                }

                removed_files.push(file.path.clone());
                removed_records += dropped_rows;

                let remaining: usize = kept.iter().map(|b| b.num_rows()).sum();
                if remaining > 0 {
                    let schema = kept[0].schema();
                    let rewritten = concat_batches(&schema, &kept)?;
                    added_files.push(
                        self.write_file(&rewritten, file.partition.clone(), batch_id)
                            .await?,
                    );
                }
                debug!(
                    path = %file.path,
                    removed_rows = dropped_rows,
                    remaining_rows = remaining,
                    "Rewrote data file"
                );
            }
        }

        added_files.extend(
            self.write_partitioned(&survivors, batch_id, processing_time)
                .await?,
        );

        let operation = if removed_files.is_empty() {
            Operation::Append
        } else {
            Operation::Overwrite
        };

        Ok(TableCommit {
            operation,
            batch_id: Some(batch_id),
            added_files,
            removed_files,
            removed_records,
            watermarks: BTreeMap::new(),
            schema: None,
        })
    }
}

/// Ordering used to pick the surviving record among duplicates.
fn precombine_key(record: &Record) -> (DateTime<Utc>, i32, i64) {
    (
        record.event_time,
        record.source_offset.partition,
        record.source_offset.offset,
    )
}

pub(crate) fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::Table(format!("Data file has no string column '{}'", name)))
}

pub(crate) fn timestamp_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a TimestampMicrosecondArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<TimestampMicrosecondArray>())
        .ok_or_else(|| Error::Table(format!("Data file has no timestamp column '{}'", name)))
}
