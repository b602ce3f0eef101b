//! Micro-batch buffering.
//!
//! Decoded records accumulate into discrete batches that carry the source
//! offset range they consumed, so a batch commit and its checkpoint always
//! describe the same span of the stream.

mod accumulator;
mod batch;

pub use accumulator::{BatchAccumulator, Flush};
pub use batch::{records_to_arrow, Batch, BatchStatistics, OffsetRange, OffsetSpan};
