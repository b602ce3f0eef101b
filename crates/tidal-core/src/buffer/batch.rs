//! Batches and their Arrow representation.

use crate::config::SchemaConfig;
use crate::record::Record;
use crate::source::SourcePosition;
use crate::table::TableSchema;
use crate::Result;
use arrow::array::{
    ArrayRef, Float64Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Inclusive offset span within one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetSpan {
    pub first: i64,
    pub last: i64,
}

/// Source offsets consumed by a batch, per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRange {
    /// Topic the offsets belong to
    pub topic: String,
    /// Spans keyed by partition
    pub spans: BTreeMap<i32, OffsetSpan>,
}

impl OffsetRange {
    /// Extend the range to cover `position`.
    pub fn include(&mut self, position: &SourcePosition) {
        if self.topic.is_empty() {
            self.topic = position.topic.clone();
        }
        self.spans
            .entry(position.partition)
            .and_modify(|span| {
                span.first = span.first.min(position.offset);
                span.last = span.last.max(position.offset);
            })
            .or_insert(OffsetSpan {
                first: position.offset,
                last: position.offset,
            });
    }

    /// Whether no offsets are covered.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Last offset per partition.
    pub fn last_offsets(&self) -> BTreeMap<i32, i64> {
        self.spans.iter().map(|(&p, span)| (p, span.last)).collect()
    }

    /// Number of offsets covered.
    pub fn len(&self) -> u64 {
        self.spans
            .values()
            .map(|span| (span.last - span.first + 1) as u64)
            .sum()
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spans: Vec<String> = self
            .spans
            .iter()
            .map(|(p, s)| format!("{}:[{}..{}]", p, s.first, s.last))
            .collect();
        write!(f, "{} {}", self.topic, spans.join(" "))
    }
}

/// A closed micro-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Monotonic batch identifier
    pub batch_id: u64,
    /// Decoded records, in arrival order
    pub records: Vec<Record>,
    /// Every offset consumed for this batch, dropped records included
    pub offset_range: OffsetRange,
    /// Records dropped by the decoder within this batch's range
    pub dropped: u64,
}

impl Batch {
    /// Summary statistics over the batch's records.
    pub fn statistics(&self) -> BatchStatistics {
        BatchStatistics::from_records(&self.records)
    }
}

/// Summary of a set of records.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatistics {
    /// Record count
    pub count: usize,
    /// Distinct record ids
    pub distinct_ids: usize,
    /// Earliest event time
    pub min_event_time: Option<DateTime<Utc>>,
    /// Latest event time
    pub max_event_time: Option<DateTime<Utc>>,
    /// Average value, rounded to 2 decimals
    pub avg_value: Option<f64>,
}

impl BatchStatistics {
    /// Compute statistics for `records`.
    pub fn from_records(records: &[Record]) -> Self {
        let distinct_ids = records
            .iter()
            .map(|r| r.id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let avg_value = (!records.is_empty()).then(|| {
            let avg = records.iter().map(|r| r.value).sum::<f64>() / records.len() as f64;
            (avg * 100.0).round() / 100.0
        });

        Self {
            count: records.len(),
            distinct_ids,
            min_event_time: records.iter().map(|r| r.event_time).min(),
            max_event_time: records.iter().map(|r| r.event_time).max(),
            avg_value,
        }
    }
}

/// Build the Arrow batch for `records`, laid out as [`TableSchema::for_records`].
pub fn records_to_arrow(
    records: &[&Record],
    schema: &SchemaConfig,
    batch_id: u64,
    processing_time: DateTime<Utc>,
) -> Result<RecordBatch> {
    let arrow_schema = TableSchema::for_records(schema).to_arrow();
    let rows = records.len();

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.id.as_str()))),
        Arc::new(
            TimestampMicrosecondArray::from_iter_values(
                records.iter().map(|r| r.event_time.timestamp_micros()),
            )
            .with_timezone("UTC"),
        ),
        Arc::new(Float64Array::from_iter_values(records.iter().map(|r| r.value))),
    ];

    for index in 0..schema.partition_key_fields.len() {
        columns.push(Arc::new(StringArray::from_iter(
            records.iter().map(|r| r.key_part(index)),
        )));
    }

    columns.push(Arc::new(StringArray::from_iter(
        records.iter().map(|r| r.source_key.as_deref()),
    )));
    columns.push(Arc::new(Int32Array::from_iter_values(
        records.iter().map(|r| r.source_offset.partition),
    )));
    columns.push(Arc::new(Int64Array::from_iter_values(
        records.iter().map(|r| r.source_offset.offset),
    )));
    columns.push(Arc::new(
        TimestampMicrosecondArray::from_iter(
            records
                .iter()
                .map(|r| r.source_timestamp.map(|t| t.timestamp_micros())),
        )
        .with_timezone("UTC"),
    ));
    columns.push(Arc::new(
        TimestampMicrosecondArray::from_iter_values(
            std::iter::repeat(processing_time.timestamp_micros()).take(rows),
        )
        .with_timezone("UTC"),
    ));
    columns.push(Arc::new(Int64Array::from_iter_values(
        std::iter::repeat(batch_id as i64).take(rows),
    )));

    Ok(RecordBatch::try_new(arrow_schema, columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use chrono::TimeZone;

    fn record(id: &str, offset: i64, value: f64, minute: u32) -> Record {
        Record {
            id: id.to_string(),
            event_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap(),
            value,
            partition_key_parts: vec![None, None, None, None, Some("2024-03-01".into()), None],
            source_offset: SourcePosition::new("iot", 0, offset),
            source_key: None,
            source_timestamp: None,
        }
    }

    #[test]
    fn test_offset_range_include() {
        let mut range = OffsetRange::default();
        range.include(&SourcePosition::new("iot", 0, 5));
        range.include(&SourcePosition::new("iot", 0, 3));
        range.include(&SourcePosition::new("iot", 1, 10));

        assert_eq!(range.topic, "iot");
        assert_eq!(range.spans[&0], OffsetSpan { first: 3, last: 5 });
        assert_eq!(range.last_offsets(), BTreeMap::from([(0, 5), (1, 10)]));
        assert_eq!(range.len(), 4);
        assert_eq!(range.to_string(), "iot 0:[3..5] 1:[10..10]");
    }

    #[test]
    fn test_statistics() {
        let records = vec![
            record("a", 0, 1.0, 5),
            record("b", 1, 2.0, 1),
            record("a", 2, 2.335, 9),
        ];
        let stats = BatchStatistics::from_records(&records);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.distinct_ids, 2);
        assert_eq!(stats.avg_value, Some(1.78));
        assert_eq!(
            stats.min_event_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap())
        );
        assert_eq!(
            stats.max_event_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 9, 0).unwrap())
        );

        let empty = BatchStatistics::from_records(&[]);
        assert_eq!(empty.count, 0);
        assert!(empty.avg_value.is_none());
    }

    #[test]
    fn test_records_to_arrow() {
        let records = vec![record("a", 0, 1.5, 0), record("b", 1, 2.5, 1)];
        let refs: Vec<&Record> = records.iter().collect();
        let batch = records_to_arrow(&refs, &SchemaConfig::default(), 7, Utc::now()).unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 15);

        let ids = batch
            .column_by_name("id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .unwrap();
        assert_eq!(ids.value(1), "b");

        let batch_ids = batch
            .column_by_name("batch_id")
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .unwrap();
        assert_eq!(batch_ids.value(0), 7);

        let dates = batch
            .column_by_name("date")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .unwrap();
        assert_eq!(dates.value(0), "2024-03-01");
        assert!(batch.column_by_name("month").unwrap().is_null(0));
    }
}
