//! CLI command implementations.

pub mod backfill;
pub mod ingest;
pub mod inspect;
pub mod rebuild;
pub mod status;

use anyhow::Result;
use std::sync::Arc;
use tidal_core::checkpoint::{CheckpointCoordinator, FileOffsetStore};
use tidal_core::engine::StreamDriver;
use tidal_core::health::HealthCheck;
use tidal_core::metrics::PipelineMetrics;
use tidal_core::retry::RetryPolicy;
use tidal_core::source::StreamSource;
use tidal_core::table::{ObjectTableStore, TableStore, TableWriter};
use tidal_core::Config;

/// Table store for the configured warehouse.
pub(crate) fn table_store(config: &Config) -> Result<Arc<dyn TableStore>> {
    Ok(Arc::new(ObjectTableStore::from_config(&config.table)?))
}

/// Writer for the configured table.
pub(crate) fn table_writer(config: &Config) -> Result<TableWriter> {
    Ok(TableWriter::new(
        table_store(config)?,
        config.table.clone(),
        config.schema.clone(),
        RetryPolicy::from(&config.retry),
    ))
}

/// Assemble a driver over `source` with the configured table and checkpoint.
pub(crate) async fn build_driver(
    config: &Config,
    source: Box<dyn StreamSource>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCheck>,
) -> Result<StreamDriver> {
    let writer = table_writer(config)?.with_metrics(Arc::clone(&metrics));
    let offsets = Arc::new(FileOffsetStore::new(config.checkpoint.dir.clone()));
    let coordinator =
        CheckpointCoordinator::open(offsets, config.checkpoint.pipeline_name.clone()).await?;

    Ok(StreamDriver::new(config, source, writer, coordinator, metrics).with_health(health))
}
