//! The pipeline driver.
//!
//! ## States
//!
//! ```text
//! Init -> Streaming -> (Flushing -> Committing -> Checkpointing -> Streaming)*
//!      -> Draining -> Stopped
//! any  -> Failed
//! ```
//!
//! A window closes one interval after its first record, or when the batch
//! reaches its size cap. Each poll waits at most until the window's deadline,
//! so polls are never raced against the window. A bounded source drains once
//! exhausted; a shutdown signal interrupts the current poll and drains.
//! Commits run outside the `select!`, so a shutdown never interrupts one: the
//! in-flight batch is committed and checkpointed, then the remainder is
//! flushed.

use crate::buffer::{BatchAccumulator, Flush};
use crate::checkpoint::CheckpointCoordinator;
use crate::config::{BatchConfig, Config, DecodePolicy, StartPolicy};
use crate::health::{components, HealthCheck};
use crate::metrics::{ErrorKind, PipelineMetrics};
use crate::record::RecordDecoder;
use crate::source::{OffsetTracker, SourceMessage, StartPositions, StreamSource};
use crate::table::TableWriter;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    Streaming,
    Flushing,
    Committing,
    Checkpointing,
    Draining,
    Stopped,
    Failed,
}

impl DriverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverState::Init => "init",
            DriverState::Streaming => "streaming",
            DriverState::Flushing => "flushing",
            DriverState::Committing => "committing",
            DriverState::Checkpointing => "checkpointing",
            DriverState::Draining => "draining",
            DriverState::Stopped => "stopped",
            DriverState::Failed => "failed",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Totals of one driver run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverReport {
    pub messages_polled: u64,
    pub records_decoded: u64,
    pub records_dropped: u64,
    pub batches_committed: u64,
    pub records_written: u64,
    pub replays: u64,
    pub empty_windows: u64,
    pub last_batch_id: Option<u64>,
    pub table_version: Option<u64>,
    pub final_state: Option<DriverState>,
}

/// Runtime knobs, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub start_policy: StartPolicy,
    pub poll_batch_size: usize,
    pub poll_timeout: Duration,
    pub decode_policy: DecodePolicy,
    /// Window length and flush timer period
    pub interval: Duration,
}

impl From<&Config> for DriverOptions {
    fn from(config: &Config) -> Self {
        Self {
            start_policy: config.source.start_policy,
            poll_batch_size: config.source.poll_batch_size,
            poll_timeout: Duration::from_millis(config.source.poll_timeout_ms),
            decode_policy: config.batch.decode_policy,
            interval: Duration::from_secs(config.batch.interval_seconds),
        }
    }
}

/// Runs one pipeline: source to table, checkpointing after every commit.
pub struct StreamDriver {
    source: Box<dyn StreamSource>,
    decoder: RecordDecoder,
    accumulator: BatchAccumulator,
    writer: TableWriter,
    coordinator: CheckpointCoordinator,
    options: DriverOptions,
    batch_config: BatchConfig,
    tracker: Arc<OffsetTracker>,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthCheck>,
    shutdown_tx: broadcast::Sender<()>,
    /// Subscribed at construction so a signal sent during `seek` is kept
    shutdown_rx: broadcast::Receiver<()>,
    state: DriverState,
    report: DriverReport,
}

impl StreamDriver {
    /// Assemble a driver. Batch ids continue from the coordinator's checkpoint.
    pub fn new(
        config: &Config,
        source: Box<dyn StreamSource>,
        writer: TableWriter,
        coordinator: CheckpointCoordinator,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let options = DriverOptions::from(config);
        let accumulator = BatchAccumulator::new(&config.batch, coordinator.next_batch_id())
            .with_interval(options.interval);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Self {
            source,
            decoder: RecordDecoder::new(config.schema.clone()),
            accumulator,
            writer,
            coordinator,
            options,
            batch_config: config.batch.clone(),
            tracker: Arc::new(OffsetTracker::new()),
            metrics,
            health: Arc::new(HealthCheck::for_pipeline()),
            shutdown_tx,
            shutdown_rx,
            state: DriverState::Init,
            report: DriverReport::default(),
        }
    }

    /// Share an externally owned health check (e.g. served over HTTP).
    pub fn with_health(mut self, health: Arc<HealthCheck>) -> Self {
        for name in [components::SOURCE, components::TABLE, components::CHECKPOINT] {
            if health.get_component_status(name).is_none() {
                health.register_component(name);
            }
        }
        self.health = health;
        self
    }

    /// Override the window length and flush timer period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.options.interval = interval;
        self.accumulator =
            BatchAccumulator::new(&self.batch_config, self.coordinator.next_batch_id())
                .with_interval(interval);
        self
    }

    /// Sender that stops the driver gracefully.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn report(&self) -> &DriverReport {
        &self.report
    }

    pub fn health(&self) -> Arc<HealthCheck> {
        self.health.clone()
    }

    pub fn tracker(&self) -> Arc<OffsetTracker> {
        self.tracker.clone()
    }

    fn set_state(&mut self, state: DriverState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Driver state");
        }
        self.state = state;
        self.health.set_pipeline_state(state.as_str());
    }

    /// Run until the source is exhausted, shutdown is requested, or a fatal
    /// error occurs. The source is closed on every exit path.
    pub async fn run(&mut self) -> Result<DriverReport> {
        info!(
            source = %self.source.describe(),
            table = %self.writer.ident(),
            pipeline = %self.coordinator.pipeline(),
            next_batch_id = self.coordinator.next_batch_id(),
            "Pipeline starting"
        );

        let result = self.stream().await;

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close source");
        }

        match result {
            Ok(()) => {
                self.set_state(DriverState::Stopped);
                self.report.final_state = Some(DriverState::Stopped);
                info!(
                    batches = self.report.batches_committed,
                    records = self.report.records_written,
                    dropped = self.report.records_dropped,
                    "Pipeline stopped"
                );
                Ok(self.report.clone())
            }
            Err(e) => {
                self.set_state(DriverState::Failed);
                self.report.final_state = Some(DriverState::Failed);
                error!(error = %e, batches = self.report.batches_committed, "Pipeline failed");
                Err(e)
            }
        }
    }

    async fn stream(&mut self) -> Result<()> {
        self.set_state(DriverState::Init);

        let resume = self.coordinator.resume_positions();
        if let Some(checkpoint) = self.coordinator.current() {
            self.tracker.restore(&checkpoint.offsets);
        }
        let start = StartPositions::resolve(self.options.start_policy, resume);
        debug!(start = ?start, "Seeking source");

        if let Err(e) = self.source.seek(&start).await {
            self.health
                .mark_unhealthy(components::SOURCE, &format!("Seek failed: {}", e));
            self.metrics.record_error(ErrorKind::Source);
            return Err(e);
        }
        self.health.mark_healthy(components::SOURCE);
        self.set_state(DriverState::Streaming);

        loop {
            let now = Instant::now();
            if self.accumulator.should_flush_at(now) {
                self.flush().await?;
            }
            let until_flush = self
                .accumulator
                .flush_deadline()
                .saturating_duration_since(Instant::now());
            let timeout = self
                .options
                .poll_timeout
                .min(until_flush)
                .max(Duration::from_millis(1));

            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, draining");
                    break;
                }

                polled = self.source.poll_batch(self.options.poll_batch_size, timeout) => {
                    let messages = match polled {
                        Ok(messages) => messages,
                        Err(Error::Source(crate::SourceError::Timeout(reason))) => {
                            self.health.mark_degraded(components::SOURCE, &reason);
                            continue;
                        }
                        Err(e) => {
                            self.health.mark_unhealthy(components::SOURCE, &format!("Poll failed: {}", e));
                            self.metrics.record_error(ErrorKind::Source);
                            return Err(e);
                        }
                    };
                    self.health.mark_healthy(components::SOURCE);
                    self.ingest(messages)?;

                    if self.accumulator.should_flush() {
                        self.flush().await?;
                    }
                    if self.source.is_exhausted() {
                        info!("Source exhausted, draining");
                        break;
                    }
                }
            }
        }

        self.set_state(DriverState::Draining);
        if !self.accumulator.is_empty() {
            self.flush().await?;
        } else if self.accumulator.has_pending_offsets() {
            debug!("Only dropped records pending at shutdown, they will be read again");
        }
        Ok(())
    }

    fn ingest(&mut self, messages: Vec<SourceMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.metrics.record_messages(messages.len() as u64);
        self.report.messages_polled += messages.len() as u64;

        for message in messages {
            self.tracker
                .update_consumed(message.position.partition, message.position.offset);

            match self.decoder.decode_message(&message) {
                Ok(record) => {
                    self.metrics.record_decoded();
                    self.report.records_decoded += 1;
                    self.accumulator.ingest(record);
                }
                Err(e) => match self.options.decode_policy {
                    DecodePolicy::Drop => {
                        warn!(position = %message.position, error = %e, "Dropping malformed record");
                        self.metrics.record_dropped();
                        self.report.records_dropped += 1;
                        self.accumulator.skip(&message.position);
                    }
                    DecodePolicy::Fail => {
                        error!(position = %message.position, error = %e, "Malformed record");
                        self.metrics.record_error(ErrorKind::Decode);
                        return Err(e.into());
                    }
                },
            }
        }

        self.metrics.set_buffered_records(self.accumulator.len());
        Ok(())
    }

    /// Close the current window, commit it and advance the checkpoint.
    async fn flush(&mut self) -> Result<()> {
        let resume_state = self.state;
        self.set_state(DriverState::Flushing);

        let batch = match self.accumulator.flush() {
            Flush::Empty => {
                self.metrics.record_empty_window();
                self.report.empty_windows += 1;
                self.set_state(resume_state);
                return Ok(());
            }
            Flush::Batch(batch) => batch,
        };
        self.metrics.set_buffered_records(0);

        self.set_state(DriverState::Committing);
        let receipt = match self.writer.commit(&batch).await {
            Ok(receipt) => {
                self.health.mark_healthy(components::TABLE);
                receipt
            }
            Err(e) => {
                self.health.mark_unhealthy(
                    components::TABLE,
                    &format!("Commit of batch {} failed: {}", batch.batch_id, e),
                );
                return Err(e);
            }
        };

        self.set_state(DriverState::Checkpointing);
        if let Err(e) = self.coordinator.advance(&receipt).await {
            self.health
                .mark_unhealthy(components::CHECKPOINT, &format!("Advance failed: {}", e));
            self.metrics.record_error(ErrorKind::Checkpoint);
            return Err(e);
        }
        self.health.mark_healthy(components::CHECKPOINT);

        for (partition, offset) in receipt.offset_range().last_offsets() {
            self.tracker.mark_committed(partition, offset);
        }
        self.metrics.set_last_batch_id(receipt.batch_id());
        self.metrics.set_source_lag(self.tracker.total_lag().max(0) as u64);

        if receipt.was_replay() {
            self.report.replays += 1;
        } else {
            self.report.batches_committed += 1;
            self.report.records_written += receipt.rows_written();
        }
        self.report.last_batch_id = Some(receipt.batch_id());
        self.report.table_version = Some(receipt.table_version());

        let stats = batch.statistics();
        info!(
            batch_id = batch.batch_id,
            version = receipt.table_version(),
            records = stats.count,
            distinct_ids = stats.distinct_ids,
            dropped = batch.dropped,
            min_event_time = ?stats.min_event_time,
            max_event_time = ?stats.max_event_time,
            avg_value = ?stats.avg_value,
            replay = receipt.was_replay(),
            "Batch statistics"
        );

        self.set_state(resume_state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{MemoryOffsetStore, OffsetStore};
    use crate::retry::RetryPolicy;
    use crate::source::{MemorySource, SourcePosition};
    use crate::table::ObjectTableStore;
    use async_trait::async_trait;

    /// Bounded source handing out one message every 5ms, collected into a
    /// local batch until the poll deadline.
    struct TrickleSource {
        next: i64,
        total: i64,
    }

    #[async_trait]
    impl StreamSource for TrickleSource {
        fn describe(&self) -> String {
            "trickle".to_string()
        }

        async fn seek(&mut self, _start: &StartPositions) -> Result<()> {
            Ok(())
        }

        async fn poll_batch(&mut self, max: usize, timeout: Duration) -> Result<Vec<SourceMessage>> {
            let deadline = Instant::now() + timeout;
            let mut batch = Vec::new();
            while batch.len() < max && self.next < self.total {
                if Instant::now() + Duration::from_millis(5) > deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                let payload = format!(
                    r#"{{"uuid":"id-{}","ts":"2024-03-01 12:00:00","consumption":1.0,"date":"2024-03-01","key":"meter-1"}}"#,
                    self.next
                );
                batch.push(SourceMessage {
                    key: None,
                    payload: Some(payload.into_bytes()),
                    position: SourcePosition::new("iot-events", 0, self.next),
                    timestamp_ms: None,
                });
                self.next += 1;
            }
            Ok(batch)
        }

        fn is_exhausted(&self) -> bool {
            self.next >= self.total
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn config() -> Config {
        Config::from_toml(
            r#"
            [source]
            bootstrap_servers = ["localhost:9092"]
            topic = "iot-events"
            poll_batch_size = 250
            poll_timeout_ms = 40

            [table]
            warehouse_path = "memory://"
            namespace = "db"
            table_name = "events"

            [batch]
            interval_seconds = 15
            decode_policy = "fail"
            "#,
        )
        .unwrap()
    }

    async fn driver(config: &Config) -> StreamDriver {
        let writer = TableWriter::new(
            Arc::new(ObjectTableStore::in_memory()),
            config.table.clone(),
            config.schema.clone(),
            RetryPolicy::immediate(3),
        );
        let coordinator = CheckpointCoordinator::open(Arc::new(MemoryOffsetStore::new()), "p")
            .await
            .unwrap();
        StreamDriver::new(
            config,
            Box::new(MemorySource::bounded("iot-events")),
            writer,
            coordinator,
            Arc::new(PipelineMetrics::new().unwrap()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_polls_lose_nothing_across_windows() {
        let mut config = config();
        config.source.poll_timeout_ms = 200;
        let offsets = Arc::new(MemoryOffsetStore::new());
        let writer = TableWriter::new(
            Arc::new(ObjectTableStore::in_memory()),
            config.table.clone(),
            config.schema.clone(),
            RetryPolicy::immediate(3),
        );
        let coordinator = CheckpointCoordinator::open(offsets.clone(), "p")
            .await
            .unwrap();
        let mut driver = StreamDriver::new(
            &config,
            Box::new(TrickleSource { next: 0, total: 100 }),
            writer,
            coordinator,
            Arc::new(PipelineMetrics::new().unwrap()),
        )
        .with_interval(Duration::from_millis(50));

        let report = driver.run().await.unwrap();
        assert_eq!(report.messages_polled, 100);
        assert_eq!(report.records_written, 100);
        assert!(report.batches_committed > 1);

        let checkpoint = offsets.load("p").await.unwrap().unwrap();
        assert_eq!(checkpoint.offsets[&0], 99);
    }

    #[tokio::test]
    async fn test_shutdown_before_run_is_kept() {
        let config = config();
        let writer = TableWriter::new(
            Arc::new(ObjectTableStore::in_memory()),
            config.table.clone(),
            config.schema.clone(),
            RetryPolicy::immediate(3),
        );
        let coordinator = CheckpointCoordinator::open(Arc::new(MemoryOffsetStore::new()), "p")
            .await
            .unwrap();
        let mut driver = StreamDriver::new(
            &config,
            Box::new(MemorySource::unbounded("iot-events")),
            writer,
            coordinator,
            Arc::new(PipelineMetrics::new().unwrap()),
        );

        driver.shutdown_handle().send(()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), driver.run())
            .await
            .expect("driver ignored shutdown")
            .unwrap();
        assert_eq!(report.final_state, Some(DriverState::Stopped));
    }

    #[test]
    fn test_options_from_config() {
        let options = DriverOptions::from(&config());
        assert_eq!(options.poll_batch_size, 250);
        assert_eq!(options.poll_timeout, Duration::from_millis(40));
        assert_eq!(options.interval, Duration::from_secs(15));
        assert_eq!(options.decode_policy, DecodePolicy::Fail);
        assert_eq!(options.start_policy, StartPolicy::ResumeFromCheckpoint);
    }

    #[tokio::test]
    async fn test_shared_health_gets_components() {
        let health = Arc::new(HealthCheck::new());
        let driver = driver(&config()).await.with_health(health.clone());
        assert_eq!(driver.state(), DriverState::Init);
        for name in [components::SOURCE, components::TABLE, components::CHECKPOINT] {
            assert!(health.get_component_status(name).is_some());
        }
    }

    #[tokio::test]
    async fn test_empty_bounded_source_stops() {
        let mut driver = driver(&config()).await;
        let health = driver.health();

        let report = driver.run().await.unwrap();
        assert_eq!(report.final_state, Some(DriverState::Stopped));
        assert_eq!(report.messages_polled, 0);
        assert_eq!(report.batches_committed, 0);
        assert_eq!(health.pipeline_state(), "stopped");
        assert!(!health.is_ready());
    }
}
