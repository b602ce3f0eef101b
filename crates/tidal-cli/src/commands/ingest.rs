//! Ingest command implementation.

use crate::server::{start_server, ServerState};
use anyhow::Result;
use std::sync::Arc;
use tidal_core::config::StartPolicy;
use tidal_core::health::HealthCheck;
use tidal_core::metrics::PipelineMetrics;
use tidal_core::source::KafkaSource;
use tidal_core::Config;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Stream from Kafka until a shutdown signal arrives.
pub async fn run(
    mut config: Config,
    bootstrap_servers: Option<String>,
    topic: Option<String>,
    start_policy: Option<StartPolicy>,
) -> Result<()> {
    // Apply CLI overrides
    if let Some(servers) = bootstrap_servers {
        config.source.bootstrap_servers = servers.split(',').map(String::from).collect();
    }
    if let Some(t) = topic {
        config.source.topic = t;
    }
    if let Some(policy) = start_policy {
        config.source.start_policy = policy;
    }
    config.validate()?;

    info!(
        topic = %config.source.topic,
        table = %config.table.qualified_name(),
        start_policy = ?config.source.start_policy,
        "Starting ingestion"
    );

    let metrics = Arc::new(PipelineMetrics::new()?);
    let health = Arc::new(HealthCheck::for_pipeline());

    let source = KafkaSource::new(&config.source)?;
    let mut driver = super::build_driver(
        &config,
        Box::new(source),
        Arc::clone(&metrics),
        Arc::clone(&health),
    )
    .await?;
    let shutdown_tx = driver.shutdown_handle();

    let server_state = Arc::new(ServerState { health, metrics });
    tokio::spawn(start_server(
        server_state,
        config.monitoring.health_port,
        config.monitoring.metrics_port,
        shutdown_tx.subscribe(),
    ));

    // Translate SIGINT and SIGTERM into a graceful driver shutdown
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, initiating graceful shutdown");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        let _ = shutdown_signal.send(());
    });

    let report = driver.run().await;
    let _ = shutdown_tx.send(());
    let report = report?;

    info!(
        batches = report.batches_committed,
        records = report.records_written,
        dropped = report.records_dropped,
        replays = report.replays,
        "Ingestion stopped"
    );
    Ok(())
}
