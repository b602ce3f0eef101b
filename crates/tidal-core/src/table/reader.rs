//! Reading table snapshots back.

use super::files::decode_parquet;
use super::schema::columns;
use super::snapshot::TableIdent;
use super::store::TableStore;
use super::writer::{string_column, timestamp_column};
use crate::{CommitError, Error, Result};
use arrow::array::{Array, Float64Array};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Verification statistics over a table's current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStatistics {
    pub version: u64,
    pub total_records: u64,
    pub distinct_ids: u64,
    /// Average value, rounded to 2 decimals
    pub avg_value: Option<f64>,
    pub earliest_event: Option<DateTime<Utc>>,
    pub latest_event: Option<DateTime<Utc>>,
    pub first_processing: Option<DateTime<Utc>>,
    pub last_processing: Option<DateTime<Utc>>,
}

/// Reads the rows of a table.
pub struct TableReader {
    store: Arc<dyn TableStore>,
    ident: TableIdent,
}

impl TableReader {
    pub fn new(store: Arc<dyn TableStore>, ident: TableIdent) -> Self {
        Self { store, ident }
    }

    /// All rows of the current snapshot.
    pub async fn scan(&self) -> Result<Vec<RecordBatch>> {
        let version = self
            .store
            .current_version(&self.ident)
            .await?
            .ok_or_else(|| Error::from(CommitError::TableNotFound(self.ident.to_string())))?;
        self.scan_version(version).await
    }

    /// All rows of a retained snapshot.
    pub async fn scan_version(&self, version: u64) -> Result<Vec<RecordBatch>> {
        let snapshot = self.store.load_snapshot(&self.ident, version).await?;
        let mut batches = Vec::new();
        for file in &snapshot.data_files {
            let data = self.store.read_data_file(&self.ident, &file.path).await?;
            batches.extend(decode_parquet(data)?);
        }
        Ok(batches)
    }

    /// Statistics of the current snapshot, `None` when the table does not exist.
    pub async fn statistics(&self) -> Result<Option<TableStatistics>> {
        let Some(version) = self.store.current_version(&self.ident).await? else {
            return Ok(None);
        };

        let batches = self.scan_version(version).await?;

        let mut ids = HashSet::new();
        let mut total_records = 0u64;
        let mut value_sum = 0.0;
        let mut value_count = 0u64;
        let mut event = MinMax::default();
        let mut processing = MinMax::default();

        for batch in &batches {
            total_records += batch.num_rows() as u64;

            let id_col = string_column(batch, columns::ID)?;
            ids.extend(id_col.iter().flatten().map(str::to_string));

            if let Some(values) = batch
                .column_by_name(columns::VALUE)
                .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            {
                for v in values.iter().flatten() {
                    value_sum += v;
                    value_count += 1;
                }
            }

            event.extend(timestamp_column(batch, columns::EVENT_TIME)?.iter().flatten());
            processing.extend(
                timestamp_column(batch, columns::PROCESSING_TIME)?
                    .iter()
                    .flatten(),
            );
        }

        let avg_value =
            (value_count > 0).then(|| ((value_sum / value_count as f64) * 100.0).round() / 100.0);

        Ok(Some(TableStatistics {
            version,
            total_records,
            distinct_ids: ids.len() as u64,
            avg_value,
            earliest_event: event.min(),
            latest_event: event.max(),
            first_processing: processing.min(),
            last_processing: processing.max(),
        }))
    }
}

/// Running min/max over microsecond timestamps.
#[derive(Default)]
struct MinMax {
    min: Option<i64>,
    max: Option<i64>,
}

impl MinMax {
    fn extend(&mut self, values: impl Iterator<Item = i64>) {
        for v in values {
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn min(&self) -> Option<DateTime<Utc>> {
        self.min.and_then(DateTime::from_timestamp_micros)
    }

    fn max(&self) -> Option<DateTime<Utc>> {
        self.max.and_then(DateTime::from_timestamp_micros)
    }
}
