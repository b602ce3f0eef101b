//! Backfill command: bulk load a JSON-lines file.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tidal_core::config::{StartPolicy, WriteMode};
use tidal_core::health::HealthCheck;
use tidal_core::metrics::PipelineMetrics;
use tidal_core::source::FileSource;
use tidal_core::Config;
use tracing::info;

/// Load every line of `file` into the table, then exit.
///
/// Each input file (by path and content) gets its own topic and checkpoint,
/// so a rerun after a failure resumes where the previous run stopped and a
/// different file with the same name is loaded in full.
pub async fn run(mut config: Config, file: PathBuf, mode: Option<WriteMode>) -> Result<()> {
    if let Some(mode) = mode {
        config.table.write_mode = mode;
    }
    let source = FileSource::open_input(&file).await?;
    config.source.start_policy = StartPolicy::ResumeFromCheckpoint;
    config.checkpoint.pipeline_name = format!(
        "{}-backfill-{}",
        config.checkpoint.pipeline_name,
        source.topic()
    );
    config.validate()?;

    info!(
        file = %file.display(),
        topic = %source.topic(),
        table = %config.table.qualified_name(),
        mode = ?config.table.write_mode,
        "Starting backfill"
    );

    let metrics = Arc::new(PipelineMetrics::new()?);
    let health = Arc::new(HealthCheck::for_pipeline());
    let mut driver = super::build_driver(&config, Box::new(source), metrics, health).await?;
    let report = driver.run().await?;

    println!("Backfill complete");
    println!("  Batches committed: {}", report.batches_committed);
    println!("  Records written:   {}", report.records_written);
    println!("  Records dropped:   {}", report.records_dropped);
    println!("  Replayed batches:  {}", report.replays);
    if let Some(version) = report.table_version {
        println!("  Table version:     {}", version);
    }
    Ok(())
}
