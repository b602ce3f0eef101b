//! Tidal Core - continuous micro-batch ingestion into versioned tables
//!
//! This library reads an ordered, partitioned stream of JSON events and
//! lands it in an object-store table with:
//!
//! - Bounded time/size micro-batches committed atomically as table snapshots
//! - Durable checkpoints advanced only after a confirmed commit
//! - Replay de-duplication against per-partition source watermarks
//! - Explicit schema negotiation, insert or upsert (copy-on-write) writes

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod source;
pub mod table;

// Re-export commonly used types
pub use config::Config;
pub use error::{CheckpointError, CommitError, DecodeError, DecodeReason, SourceError};
pub use error::{Error, Result};
