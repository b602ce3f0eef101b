//! Versioned table storage.
//!
//! This module provides:
//! - Table schema and explicit schema negotiation
//! - Immutable snapshots written as `metadata/v{N}.metadata.json`
//! - The [`TableStore`] seam and its `object_store` implementation
//! - [`TableWriter`] for atomic batch commits (insert or upsert)
//! - [`TableReader`] for scans and verification statistics

mod files;
pub mod reader;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod writer;

pub use reader::{TableReader, TableStatistics};
pub use schema::{negotiate, FieldType, SchemaCheck, SchemaDiff, SchemaField, TableSchema, TypeConflict};
pub use snapshot::{DataFileRef, Operation, TableCommit, TableIdent, TableSnapshot};
pub use store::{ObjectTableStore, TableStore};
pub use writer::{CommitReceipt, TableWriter};
