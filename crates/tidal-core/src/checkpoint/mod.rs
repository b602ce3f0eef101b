//! Durable source checkpoints.

mod coordinator;
mod offset_store;

pub use coordinator::CheckpointCoordinator;
pub use offset_store::{Checkpoint, FileOffsetStore, MemoryOffsetStore, OffsetStore};
