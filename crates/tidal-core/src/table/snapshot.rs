//! Immutable table snapshots.
//!
//! Each commit writes one `metadata/v{N}.metadata.json` object holding the
//! complete [`TableSnapshot`] for version N: schema, properties, the live
//! data file list, and the cumulative per-partition source watermarks.

use super::schema::TableSchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Table metadata format version.
pub const FORMAT_VERSION: u32 = 2;

/// Property keys recorded in table metadata.
pub mod properties {
    pub const FORMAT_VERSION: &str = "format-version";
    pub const WRITE_FORMAT: &str = "write.format.default";
    pub const COMPRESSION: &str = "write.parquet.compression-codec";
    pub const METADATA_DELETE_AFTER_COMMIT: &str = "write.metadata.delete-after-commit.enabled";
    pub const METADATA_PREVIOUS_VERSIONS_MAX: &str = "write.metadata.previous-versions-max";
    pub const WRITE_MODE: &str = "tidal.write-mode";
    pub const PARTITION_FIELD: &str = "tidal.partition-field";
    pub const RECORD_KEY: &str = "tidal.record-key";
    pub const PRECOMBINE_FIELD: &str = "tidal.precombine-field";
}

/// Identifies a table within a warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdent {
    pub namespace: String,
    pub name: String,
}

impl TableIdent {
    /// Create a new identifier.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Object-store prefix of the table.
    pub fn location(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// What a commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Table created, no data
    Create,
    /// Files added
    Append,
    /// Files added and rewritten
    Overwrite,
    /// Schema replaced, data untouched
    Evolve,
}

/// A Parquet data file referenced by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileRef {
    /// Path relative to the table location
    pub path: String,
    /// Rows in the file
    pub record_count: u64,
    /// File size in bytes
    pub size_bytes: u64,
    /// CRC32 of the file contents, hex
    pub checksum: String,
    /// Partition path segment, e.g. `date=2024-03-01`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Batch that wrote the file
    pub batch_id: u64,
}

/// Commit summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<u64>,
    pub added_records: u64,
    pub removed_records: u64,
    pub total_records: u64,
    pub added_files: usize,
    pub removed_files: usize,
    /// Highest source offset reflected in the table, keyed `topic/partition`
    #[serde(default)]
    pub watermarks: BTreeMap<String, i64>,
}

/// An immutable, versioned view of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub format_version: u32,
    pub table_uuid: uuid::Uuid,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u64>,
    pub schema: TableSchema,
    pub properties: BTreeMap<String, String>,
    pub data_files: Vec<DataFileRef>,
    /// Retained metadata files of previous versions, oldest first
    #[serde(default)]
    pub metadata_files: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub summary: SnapshotSummary,
}

impl TableSnapshot {
    /// Watermark key for a source partition.
    pub fn watermark_key(topic: &str, partition: i32) -> String {
        format!("{}/{}", topic, partition)
    }

    /// Highest committed offset for a source partition.
    pub fn watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        self.summary
            .watermarks
            .get(&Self::watermark_key(topic, partition))
            .copied()
    }

    /// Rows in the live data files.
    pub fn total_records(&self) -> u64 {
        self.data_files.iter().map(|f| f.record_count).sum()
    }

    /// Number of previous metadata versions to retain.
    pub fn previous_versions_max(&self) -> Option<usize> {
        self.properties
            .get(properties::METADATA_PREVIOUS_VERSIONS_MAX)
            .and_then(|v| v.parse().ok())
    }

    /// Whether old metadata files are deleted after each commit.
    pub fn delete_after_commit(&self) -> bool {
        self.properties
            .get(properties::METADATA_DELETE_AFTER_COMMIT)
            .map_or(false, |v| v == "true")
    }
}

/// The changes one commit applies on top of its base snapshot.
#[derive(Debug, Clone)]
pub struct TableCommit {
    pub operation: Operation,
    pub batch_id: Option<u64>,
    pub added_files: Vec<DataFileRef>,
    /// Paths of data files no longer live
    pub removed_files: Vec<String>,
    /// Rows removed by rewrites
    pub removed_records: u64,
    /// Watermarks to merge (by max) into the snapshot's
    pub watermarks: BTreeMap<String, i64>,
    /// Replacement schema; `None` keeps the base schema
    pub schema: Option<TableSchema>,
}

impl TableCommit {
    /// A commit that only installs a new schema.
    pub fn evolve(schema: TableSchema) -> Self {
        Self {
            operation: Operation::Evolve,
            batch_id: None,
            added_files: Vec::new(),
            removed_files: Vec::new(),
            removed_records: 0,
            watermarks: BTreeMap::new(),
            schema: Some(schema),
        }
    }

    /// Rows added by the commit's new files.
    pub fn added_records(&self) -> u64 {
        self.added_files.iter().map(|f| f.record_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::schema::FieldType;

    fn snapshot() -> TableSnapshot {
        TableSnapshot {
            format_version: FORMAT_VERSION,
            table_uuid: uuid::Uuid::new_v4(),
            version: 3,
            parent_version: Some(2),
            schema: TableSchema::new([("id", FieldType::String, true)]),
            properties: BTreeMap::from([
                (properties::METADATA_PREVIOUS_VERSIONS_MAX.to_string(), "5".to_string()),
                (properties::METADATA_DELETE_AFTER_COMMIT.to_string(), "true".to_string()),
            ]),
            data_files: vec![DataFileRef {
                path: "data/date=2024-03-01/00000000000000000001-x.parquet".into(),
                record_count: 4,
                size_bytes: 1024,
                checksum: "deadbeef".into(),
                partition: Some("date=2024-03-01".into()),
                batch_id: 1,
            }],
            metadata_files: vec!["metadata/v1.metadata.json".into()],
            timestamp: Utc::now(),
            summary: SnapshotSummary {
                operation: Operation::Append,
                batch_id: Some(1),
                added_records: 4,
                removed_records: 0,
                total_records: 4,
                added_files: 1,
                removed_files: 0,
                watermarks: BTreeMap::from([("iot/0".to_string(), 4)]),
            },
        }
    }

    #[test]
    fn test_watermark_lookup() {
        let snapshot = snapshot();
        assert_eq!(snapshot.watermark("iot", 0), Some(4));
        assert_eq!(snapshot.watermark("iot", 1), None);
        assert_eq!(snapshot.total_records(), 4);
        assert_eq!(snapshot.previous_versions_max(), Some(5));
        assert!(snapshot.delete_after_commit());
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let snapshot = snapshot();
        let json = serde_json::to_string_pretty(&snapshot).unwrap();
        assert!(json.contains("\"operation\": \"append\""));
        let back: TableSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_ident_location() {
        let ident = TableIdent::new("kafka_iceberg", "iot_events");
        assert_eq!(ident.location(), "kafka_iceberg/iot_events");
        assert_eq!(ident.to_string(), "kafka_iceberg.iot_events");
    }
}
