//! Table schema and schema negotiation.
//!
//! A batch never silently reshapes the table. [`negotiate`] compares the
//! schema a batch would write against the table's current schema and either
//! accepts it or returns a [`SchemaDiff`] describing exactly what is wrong:
//!
//! - required table fields the batch does not carry
//! - batch fields the table does not know
//! - fields whose batch type cannot be stored in the table column
//!
//! Narrower values fit wider columns (int into long, int or long into double).

use crate::config::SchemaConfig;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Column types supported by the table store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Boolean type
    Boolean,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 64-bit double
    Double,
    /// UTF-8 string
    String,
    /// Timestamp with microsecond precision, UTC
    Timestamp,
}

impl FieldType {
    /// Type name as written in table metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Timestamp => "timestamp",
        }
    }

    /// Whether values of this type can be stored in a `column` of the given type.
    pub fn fits_in(&self, column: FieldType) -> bool {
        use FieldType::*;

        *self == column || matches!((self, column), (Int, Long) | (Int, Double) | (Long, Double))
    }

    /// Arrow representation of this type.
    pub fn to_arrow(&self) -> DataType {
        match self {
            FieldType::Boolean => DataType::Boolean,
            FieldType::Int => DataType::Int32,
            FieldType::Long => DataType::Int64,
            FieldType::Double => DataType::Float64,
            FieldType::String => DataType::Utf8,
            FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field ID
    pub id: i32,
    /// Field name
    pub name: String,
    /// Field type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the field is required
    pub required: bool,
    /// Optional documentation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

/// Table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Schema ID
    pub schema_id: i32,
    /// Schema fields
    pub fields: Vec<SchemaField>,
}

/// Column names of the processing metadata added to every row.
pub mod columns {
    pub const ID: &str = "id";
    pub const EVENT_TIME: &str = "event_time";
    pub const VALUE: &str = "value";
    pub const SOURCE_KEY: &str = "source_key";
    pub const SOURCE_PARTITION: &str = "source_partition";
    pub const SOURCE_OFFSET: &str = "source_offset";
    pub const SOURCE_TIMESTAMP: &str = "source_timestamp";
    pub const PROCESSING_TIME: &str = "processing_time";
    pub const BATCH_ID: &str = "batch_id";
}

impl TableSchema {
    /// Build a schema from `(name, type, required)` triples, numbering fields from 1.
    pub fn new<'a>(fields: impl IntoIterator<Item = (&'a str, FieldType, bool)>) -> Self {
        let fields = fields
            .into_iter()
            .enumerate()
            .map(|(i, (name, field_type, required))| SchemaField {
                id: i as i32 + 1,
                name: name.to_string(),
                field_type,
                required,
                doc: None,
            })
            .collect();

        Self {
            schema_id: 0,
            fields,
        }
    }

    /// The schema every batch of decoded records is written with.
    pub fn for_records(schema: &SchemaConfig) -> Self {
        use columns::*;

        let mut fields: Vec<(&str, FieldType, bool)> = vec![
            (ID, FieldType::String, true),
            (EVENT_TIME, FieldType::Timestamp, true),
            (VALUE, FieldType::Double, true),
        ];
        fields.extend(
            schema
                .partition_key_fields
                .iter()
                .map(|name| (name.as_str(), FieldType::String, false)),
        );
        fields.extend([
            (SOURCE_KEY, FieldType::String, false),
            (SOURCE_PARTITION, FieldType::Int, true),
            (SOURCE_OFFSET, FieldType::Long, true),
            (SOURCE_TIMESTAMP, FieldType::Timestamp, false),
            (PROCESSING_TIME, FieldType::Timestamp, true),
            (BATCH_ID, FieldType::Long, true),
        ]);

        Self::new(fields)
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Return a copy with one more field appended, bumping the schema id.
    pub fn with_field(&self, name: &str, field_type: FieldType, required: bool) -> Self {
        let next_id = self.fields.iter().map(|f| f.id).max().unwrap_or(0) + 1;
        let mut evolved = self.clone();
        evolved.schema_id += 1;
        evolved.fields.push(SchemaField {
            id: next_id,
            name: name.to_string(),
            field_type,
            required,
            doc: None,
        });
        evolved
    }

    /// Arrow schema with the same columns in the same order.
    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|f| Field::new(&f.name, f.field_type.to_arrow(), !f.required))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

/// A field whose batch type cannot be stored in the table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeConflict {
    /// Field name
    pub field: String,
    /// Column type in the table
    pub table_type: FieldType,
    /// Type the batch carries
    pub batch_type: FieldType,
}

/// Differences that make a batch incompatible with a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    /// Required table fields absent from the batch
    pub missing_required: Vec<String>,
    /// Batch fields the table does not have
    pub unknown_fields: Vec<String>,
    /// Fields with incompatible types
    pub type_conflicts: Vec<TypeConflict>,
}

impl SchemaDiff {
    /// True when nothing is wrong.
    pub fn is_empty(&self) -> bool {
        self.missing_required.is_empty()
            && self.unknown_fields.is_empty()
            && self.type_conflicts.is_empty()
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing_required.is_empty() {
            parts.push(format!(
                "missing required fields [{}]",
                self.missing_required.join(", ")
            ));
        }
        if !self.unknown_fields.is_empty() {
            parts.push(format!(
                "unknown fields [{}]",
                self.unknown_fields.join(", ")
            ));
        }
        if !self.type_conflicts.is_empty() {
            let conflicts: Vec<String> = self
                .type_conflicts
                .iter()
                .map(|c| format!("{}: {} -> {}", c.field, c.batch_type, c.table_type))
                .collect();
            parts.push(format!("type conflicts [{}]", conflicts.join(", ")));
        }
        if parts.is_empty() {
            f.write_str("no differences")
        } else {
            f.write_str(&parts.join("; "))
        }
    }
}

/// Outcome of schema negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCheck {
    /// The batch can be written as-is
    Matches,
    /// The batch cannot be written
    Mismatch(SchemaDiff),
}

/// Compare a batch schema against the table schema.
pub fn negotiate(table: &TableSchema, batch: &TableSchema) -> SchemaCheck {
    let table_fields: HashMap<&str, &SchemaField> =
        table.fields.iter().map(|f| (f.name.as_str(), f)).collect();
    let batch_fields: HashMap<&str, &SchemaField> =
        batch.fields.iter().map(|f| (f.name.as_str(), f)).collect();

    let mut diff = SchemaDiff::default();

    for field in &batch.fields {
        match table_fields.get(field.name.as_str()) {
            None => diff.unknown_fields.push(field.name.clone()),
            Some(column) => {
                if !field.field_type.fits_in(column.field_type) {
                    diff.type_conflicts.push(TypeConflict {
                        field: field.name.clone(),
                        table_type: column.field_type,
                        batch_type: field.field_type,
                    });
                } else if field.field_type != column.field_type {
                    debug!(
                        field = %field.name,
                        table_type = %column.field_type,
                        batch_type = %field.field_type,
                        "Batch type fits in wider table column"
                    );
                }
            }
        }
    }

    diff.missing_required = table
        .fields
        .iter()
        .filter(|f| f.required && !batch_fields.contains_key(f.name.as_str()))
        .map(|f| f.name.clone())
        .collect();

    if diff.is_empty() {
        SchemaCheck::Matches
    } else {
        SchemaCheck::Mismatch(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TableSchema {
        TableSchema::new([
            ("id", FieldType::String, true),
            ("event_time", FieldType::Timestamp, true),
            ("value", FieldType::Double, true),
        ])
    }

    #[test]
    fn test_identical_schemas_match() {
        assert_eq!(negotiate(&base(), &base()), SchemaCheck::Matches);
    }

    #[test]
    fn test_missing_required_field() {
        let table = base().with_field("region", FieldType::String, true);
        match negotiate(&table, &base()) {
            SchemaCheck::Mismatch(diff) => {
                assert_eq!(diff.missing_required, vec!["region".to_string()]);
                assert!(diff.unknown_fields.is_empty());
            }
            SchemaCheck::Matches => panic!("expected mismatch"),
        }
    }

    #[test]
    fn test_missing_optional_field_matches() {
        let table = base().with_field("region", FieldType::String, false);
        assert_eq!(negotiate(&table, &base()), SchemaCheck::Matches);
    }

    #[test]
    fn test_unknown_batch_field() {
        let batch = base().with_field("extra", FieldType::Long, false);
        match negotiate(&base(), &batch) {
            SchemaCheck::Mismatch(diff) => assert_eq!(diff.unknown_fields, vec!["extra"]),
            SchemaCheck::Matches => panic!("expected mismatch"),
        }
    }

    #[test]
    fn test_widening_fits() {
        let table = TableSchema::new([("n", FieldType::Long, true), ("x", FieldType::Double, true)]);
        let batch = TableSchema::new([("n", FieldType::Int, true), ("x", FieldType::Long, true)]);
        assert_eq!(negotiate(&table, &batch), SchemaCheck::Matches);
    }

    #[test]
    fn test_narrowing_conflicts() {
        let table = TableSchema::new([("n", FieldType::Int, true), ("s", FieldType::Long, true)]);
        let batch = TableSchema::new([("n", FieldType::Long, true), ("s", FieldType::String, true)]);
        match negotiate(&table, &batch) {
            SchemaCheck::Mismatch(diff) => {
                assert_eq!(diff.type_conflicts.len(), 2);
                assert_eq!(diff.type_conflicts[0].table_type, FieldType::Int);
                assert_eq!(diff.type_conflicts[0].batch_type, FieldType::Long);
            }
            SchemaCheck::Matches => panic!("expected mismatch"),
        }
    }

    #[test]
    fn test_record_schema_layout() {
        let schema = TableSchema::for_records(&SchemaConfig::default());
        assert_eq!(schema.fields[0].name, "id");
        assert!(schema.field("event_time").unwrap().required);
        assert!(!schema.field("date").unwrap().required);
        assert_eq!(schema.field("batch_id").unwrap().field_type, FieldType::Long);
        assert_eq!(schema.to_arrow().fields().len(), schema.fields.len());
    }

    #[test]
    fn test_with_field_bumps_ids() {
        let evolved = base().with_field("region", FieldType::String, true);
        assert_eq!(evolved.schema_id, 1);
        assert_eq!(evolved.field("region").unwrap().id, 4);
    }

    #[test]
    fn test_diff_display() {
        let diff = SchemaDiff {
            missing_required: vec!["region".into()],
            unknown_fields: vec![],
            type_conflicts: vec![TypeConflict {
                field: "value".into(),
                table_type: FieldType::Long,
                batch_type: FieldType::Double,
            }],
        };
        let text = diff.to_string();
        assert!(text.contains("missing required fields [region]"));
        assert!(text.contains("value: double -> long"));
    }

    #[test]
    fn test_schema_serde() {
        let json = serde_json::to_string(&base()).unwrap();
        assert!(json.contains("\"type\":\"timestamp\""));
        let back: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, base());
    }
}
