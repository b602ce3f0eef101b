//! Pipeline metrics.

mod pipeline;

pub use pipeline::{ErrorKind, PipelineMetrics};
