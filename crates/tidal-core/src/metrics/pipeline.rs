//! Prometheus metrics export.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

const NAMESPACE: &str = "tidal";

/// Commit duration buckets, in seconds.
const COMMIT_DURATION_BUCKETS: [f64; 8] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Error categories for labeled metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Source poll, seek, or data loss errors
    Source,
    /// Malformed records
    Decode,
    /// Schema negotiation failures
    Schema,
    /// Concurrent write conflicts
    Conflict,
    /// Object storage failures
    Storage,
    /// Checkpoint persistence errors
    Checkpoint,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::Source => "source",
            ErrorKind::Decode => "decode",
            ErrorKind::Schema => "schema",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Other => "other",
        }
    }
}

/// Counters, gauges and histograms for one pipeline.
pub struct PipelineMetrics {
    registry: Registry,

    messages_total: IntCounter,
    records_decoded_total: IntCounter,
    records_dropped_total: IntCounter,
    batches_committed_total: IntCounter,
    rows_written_total: IntCounter,
    replays_total: IntCounter,
    empty_windows_total: IntCounter,
    commit_retries_total: IntCounter,
    storage_alerts_total: IntCounter,
    errors_total: IntCounterVec,

    buffered_records: IntGauge,
    source_lag: IntGauge,
    table_version: IntGauge,
    last_batch_id: IntGauge,

    commit_duration_seconds: Histogram,
}

impl PipelineMetrics {
    /// Create metrics registered in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in `registry`.
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let messages_total = counter("messages_total", "Messages polled from the source")?;
        let records_decoded_total = counter("records_decoded_total", "Records decoded")?;
        let records_dropped_total =
            counter("records_dropped_total", "Malformed records dropped")?;
        let batches_committed_total =
            counter("batches_committed_total", "Batches committed to the table")?;
        let rows_written_total = counter("rows_written_total", "Rows written to the table")?;
        let replays_total = counter("replays_total", "Batches already reflected in the table")?;
        let empty_windows_total =
            counter("empty_windows_total", "Windows closed without records")?;
        let commit_retries_total = counter("commit_retries_total", "Commit retry attempts")?;
        let storage_alerts_total = counter(
            "storage_alerts_total",
            "Alerts raised for consecutive storage failures",
        )?;

        let buffered_records = gauge("buffered_records", "Records waiting in the open batch")?;
        let source_lag = gauge("source_lag", "Consumed but uncommitted offsets")?;
        let table_version = gauge("table_version", "Latest committed table version")?;
        let last_batch_id = gauge("last_batch_id", "Last checkpointed batch id")?;

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Errors by kind").namespace(NAMESPACE),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let commit_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("commit_duration_seconds", "Table commit latency")
                .namespace(NAMESPACE)
                .buckets(COMMIT_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(commit_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            messages_total,
            records_decoded_total,
            records_dropped_total,
            batches_committed_total,
            rows_written_total,
            replays_total,
            empty_windows_total,
            commit_retries_total,
            storage_alerts_total,
            errors_total,
            buffered_records,
            source_lag,
            table_version,
            last_batch_id,
            commit_duration_seconds,
        })
    }

    pub fn record_messages(&self, count: u64) {
        self.messages_total.inc_by(count);
    }

    pub fn record_decoded(&self) {
        self.records_decoded_total.inc();
    }

    pub fn record_dropped(&self) {
        self.records_dropped_total.inc();
        self.record_error(ErrorKind::Decode);
    }

    /// Record a successful commit.
    pub fn record_commit(&self, rows: u64, version: u64, duration: Duration) {
        self.batches_committed_total.inc();
        self.rows_written_total.inc_by(rows);
        self.table_version.set(version as i64);
        self.commit_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    pub fn record_empty_window(&self) {
        self.empty_windows_total.inc();
    }

    pub fn record_commit_retry(&self) {
        self.commit_retries_total.inc();
    }

    pub fn record_storage_alert(&self) {
        self.storage_alerts_total.inc();
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors_total.with_label_values(&[kind.as_label()]).inc();
    }

    pub fn set_buffered_records(&self, count: usize) {
        self.buffered_records.set(count as i64);
    }

    pub fn set_source_lag(&self, lag: u64) {
        self.source_lag.set(lag as i64);
    }

    pub fn set_last_batch_id(&self, batch_id: u64) {
        self.last_batch_id.set(batch_id as i64);
    }

    pub fn messages_total(&self) -> u64 {
        self.messages_total.get()
    }

    pub fn records_dropped_total(&self) -> u64 {
        self.records_dropped_total.get()
    }

    pub fn batches_committed_total(&self) -> u64 {
        self.batches_committed_total.get()
    }

    pub fn rows_written_total(&self) -> u64 {
        self.rows_written_total.get()
    }

    pub fn commit_retries_total(&self) -> u64 {
        self.commit_retries_total.get()
    }

    pub fn storage_alerts_total(&self) -> u64 {
        self.storage_alerts_total.get()
    }

    pub fn errors_by_kind(&self, kind: ErrorKind) -> u64 {
        self.errors_total.with_label_values(&[kind.as_label()]).get()
    }

    /// Export all metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_messages(5);
        metrics.record_decoded();
        metrics.record_dropped();
        metrics.record_commit(4, 2, Duration::from_millis(30));

        assert_eq!(metrics.messages_total(), 5);
        assert_eq!(metrics.records_dropped_total(), 1);
        assert_eq!(metrics.errors_by_kind(ErrorKind::Decode), 1);
        assert_eq!(metrics.batches_committed_total(), 1);
        assert_eq!(metrics.rows_written_total(), 4);
    }

    #[test]
    fn test_export_text() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_commit(10, 3, Duration::from_millis(120));
        metrics.record_error(ErrorKind::Storage);

        let text = metrics.export();
        assert!(text.contains("tidal_rows_written_total 10"));
        assert!(text.contains("tidal_table_version 3"));
        assert!(text.contains("tidal_errors_total{kind=\"storage\"} 1"));
        assert!(text.contains("tidal_commit_duration_seconds_bucket"));
    }
}
