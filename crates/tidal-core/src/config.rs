//! Configuration structures for tidal.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.
//! Every component receives the section it needs at construction time.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Stream source configuration
    pub source: SourceConfig,

    /// Destination table configuration
    pub table: TableConfig,

    /// Record schema (field names in the incoming JSON)
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Micro-batch window configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Checkpoint storage configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Retry policy for commits
    #[serde(default)]
    pub retry: RetryConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Stream source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Topic to consume from
    pub topic: String,

    /// Consumer group ID (used for client identification; positions are
    /// owned by the checkpoint, not the group)
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Where to start when the pipeline launches
    #[serde(default)]
    pub start_policy: StartPolicy,

    /// Fail the pipeline when requested offsets were deleted upstream,
    /// instead of skipping ahead to the earliest retained offset
    #[serde(default)]
    pub fail_on_data_loss: bool,

    /// Maximum messages returned by one poll
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,

    /// Poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Security configuration
    #[serde(default)]
    pub security: SourceSecurityConfig,
}

/// Where the source starts reading.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StartPolicy {
    /// Start from the earliest retained offset
    Earliest,
    /// Start from the end of the stream
    Latest,
    /// Resume strictly after the last checkpoint (earliest when none exists)
    #[default]
    ResumeFromCheckpoint,
}

/// Source security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,
}

/// Field names of the incoming JSON records.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SchemaConfig {
    /// Unique record identifier field
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Event timestamp field
    #[serde(default = "default_event_time_field")]
    pub event_time_field: String,

    /// Numeric measurement field
    #[serde(default = "default_value_field")]
    pub value_field: String,

    /// String fields carried as partition-key parts, in column order
    #[serde(default = "default_partition_key_fields")]
    pub partition_key_fields: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            id_field: default_id_field(),
            event_time_field: default_event_time_field(),
            value_field: default_value_field(),
            partition_key_fields: default_partition_key_fields(),
        }
    }
}

/// Micro-batch window configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Window length in seconds (time-based flush trigger)
    #[serde(default = "default_batch_interval_seconds")]
    pub interval_seconds: u64,

    /// Maximum records per batch (size-based flush trigger)
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// What to do with records that fail to decode
    #[serde(default)]
    pub decode_policy: DecodePolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_batch_interval_seconds(),
            max_records: default_max_records(),
            decode_policy: DecodePolicy::default(),
        }
    }
}

/// Policy for records that fail to decode.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Count the record and drop it
    #[default]
    Drop,
    /// Halt the pipeline
    Fail,
}

/// Destination table configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    /// Warehouse path (s3://bucket/prefix, memory://, or a local directory)
    pub warehouse_path: String,

    /// Namespace (database) name
    pub namespace: String,

    /// Table name
    pub table_name: String,

    /// Insert-only or upsert by record id
    #[serde(default)]
    pub write_mode: WriteMode,

    /// Record field used as the data file partition path
    #[serde(default = "default_partition_field")]
    pub partition_field: Option<String>,

    /// Parquet compression
    #[serde(default)]
    pub compression: ParquetCompression,

    /// Number of metadata versions retained after each commit
    #[serde(default = "default_retention_count")]
    pub retention_count: usize,

    /// Permit the destructive rebuild operation
    #[serde(default)]
    pub allow_rebuild: bool,

    /// Drop and recreate the table on the first batch of each run
    /// (requires `allow_rebuild`)
    #[serde(default)]
    pub rebuild_on_start: bool,

    /// AWS region (for S3 warehouses)
    pub aws_region: Option<String>,

    /// S3 endpoint (for MinIO or other S3-compatible storage)
    pub s3_endpoint: Option<String>,
}

impl TableConfig {
    /// Fully qualified table name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.table_name)
    }
}

/// How batches are applied to the table.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Append every record
    #[default]
    Insert,
    /// Keep one row per record id, latest event time wins
    Upsert,
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Snappy compression (default, good balance)
    #[default]
    Snappy,
    /// Zstd compression (better ratio)
    Zstd,
    /// LZ4 compression (faster)
    Lz4,
    /// Gzip compression
    Gzip,
    /// No compression
    None,
}

impl ParquetCompression {
    /// Codec name as recorded in table properties.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParquetCompression::Snappy => "snappy",
            ParquetCompression::Zstd => "zstd",
            ParquetCompression::Lz4 => "lz4",
            ParquetCompression::Gzip => "gzip",
            ParquetCompression::None => "uncompressed",
        }
    }
}

/// Checkpoint storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    /// Directory holding one checkpoint file per pipeline
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Pipeline name (checkpoint key)
    #[serde(default = "default_pipeline_name")]
    pub pipeline_name: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            pipeline_name: default_pipeline_name(),
        }
    }
}

/// Retry behaviour for table commits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts on concurrent write conflicts before giving up
    #[serde(default = "default_conflict_max_attempts")]
    pub conflict_max_attempts: u32,

    /// Attempts on storage failures; unbounded when absent
    #[serde(default)]
    pub storage_max_attempts: Option<u32>,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Add ±25% jitter to delays
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Consecutive storage failures before raising an alert
    #[serde(default = "default_alert_after_attempts")]
    pub alert_after_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            conflict_max_attempts: default_conflict_max_attempts(),
            storage_max_attempts: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            alert_after_attempts: default_alert_after_attempts(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive for tracing-subscriber.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_consumer_group() -> String {
    "tidal".to_string()
}
fn default_poll_batch_size() -> usize {
    1000
}
fn default_poll_timeout_ms() -> u64 {
    1000
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_id_field() -> String {
    "uuid".to_string()
}
fn default_event_time_field() -> String {
    "ts".to_string()
}
fn default_value_field() -> String {
    "consumption".to_string()
}
fn default_partition_key_fields() -> Vec<String> {
    ["month", "day", "hour", "minute", "date", "key"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_batch_interval_seconds() -> u64 {
    60
}
fn default_max_records() -> usize {
    100_000
}
fn default_partition_field() -> Option<String> {
    Some("date".to_string())
}
fn default_retention_count() -> usize {
    5
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}
fn default_pipeline_name() -> String {
    "default".to_string()
}
fn default_conflict_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> bool {
    true
}
fn default_alert_after_attempts() -> u32 {
    10
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.source.topic.is_empty() {
            return Err(crate::Error::Config("Source topic is required".into()));
        }

        if self.table.warehouse_path.is_empty() {
            return Err(crate::Error::Config("Warehouse path is required".into()));
        }

        if self.table.namespace.is_empty() || self.table.table_name.is_empty() {
            return Err(crate::Error::Config(
                "Table namespace and name are required".into(),
            ));
        }

        if self.table.retention_count == 0 {
            return Err(crate::Error::Config(
                "Retention count must keep at least one version".into(),
            ));
        }

        if self.table.rebuild_on_start && !self.table.allow_rebuild {
            return Err(crate::Error::Config(
                "rebuild_on_start requires allow_rebuild".into(),
            ));
        }

        if let Some(ref field) = self.table.partition_field {
            if !self.schema.partition_key_fields.contains(field) {
                return Err(crate::Error::Config(format!(
                    "Partition field '{}' is not one of the partition key fields",
                    field
                )));
            }
        }

        if self.batch.interval_seconds == 0 || self.batch.max_records == 0 {
            return Err(crate::Error::Config(
                "Batch interval and max records must be positive".into(),
            ));
        }

        if self.checkpoint.pipeline_name.is_empty() {
            return Err(crate::Error::Config("Pipeline name is required".into()));
        }

        if self.retry.conflict_max_attempts == 0 {
            return Err(crate::Error::Config(
                "conflict_max_attempts must be at least 1".into(),
            ));
        }

        if self.table.rebuild_on_start {
            tracing::warn!(
                table = %self.table.qualified_name(),
                "rebuild_on_start is enabled: the table will be dropped on the first batch"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [source]
        bootstrap_servers = ["localhost:9092"]
        topic = "iot-events"

        [table]
        warehouse_path = "/tmp/warehouse"
        namespace = "kafka_iceberg"
        table_name = "iot_events"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.source.start_policy, StartPolicy::ResumeFromCheckpoint);
        assert!(!config.source.fail_on_data_loss);
        assert_eq!(config.batch.interval_seconds, 60);
        assert_eq!(config.batch.decode_policy, DecodePolicy::Drop);
        assert_eq!(config.table.write_mode, WriteMode::Insert);
        assert_eq!(config.table.retention_count, 5);
        assert_eq!(config.table.compression, ParquetCompression::Snappy);
        assert_eq!(config.table.partition_field.as_deref(), Some("date"));
        assert!(!config.table.allow_rebuild);
        assert_eq!(config.schema.id_field, "uuid");
        assert_eq!(config.schema.partition_key_fields.len(), 6);
        assert_eq!(config.table.qualified_name(), "kafka_iceberg.iot_events");
    }

    #[test]
    fn test_start_policy_kebab_case() {
        let toml = MINIMAL.replace(
            "topic = \"iot-events\"",
            "topic = \"iot-events\"\nstart_policy = \"earliest\"\nfail_on_data_loss = true",
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.source.start_policy, StartPolicy::Earliest);
        assert!(config.source.fail_on_data_loss);

        let policy: StartPolicy =
            serde_json::from_str("\"resume-from-checkpoint\"").unwrap();
        assert_eq!(policy, StartPolicy::ResumeFromCheckpoint);
    }

    #[test]
    fn test_upsert_mode() {
        let toml = MINIMAL.replace(
            "table_name = \"iot_events\"",
            "table_name = \"iot_events\"\nwrite_mode = \"upsert\"\nretention_count = 3",
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.table.write_mode, WriteMode::Upsert);
        assert_eq!(config.table.retention_count, 3);
    }

    #[test]
    fn test_config_validation_empty_topic() {
        let toml = MINIMAL.replace("topic = \"iot-events\"", "topic = \"\"");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn test_config_validation_empty_warehouse() {
        let toml = MINIMAL.replace("warehouse_path = \"/tmp/warehouse\"", "warehouse_path = \"\"");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("Warehouse"));
    }

    #[test]
    fn test_rebuild_on_start_requires_opt_in() {
        let toml = MINIMAL.replace(
            "table_name = \"iot_events\"",
            "table_name = \"iot_events\"\nrebuild_on_start = true",
        );
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("allow_rebuild"));

        let toml = MINIMAL.replace(
            "table_name = \"iot_events\"",
            "table_name = \"iot_events\"\nrebuild_on_start = true\nallow_rebuild = true",
        );
        assert!(Config::from_toml(&toml).is_ok());
    }

    #[test]
    fn test_partition_field_must_be_known() {
        let toml = MINIMAL.replace(
            "table_name = \"iot_events\"",
            "table_name = \"iot_events\"\npartition_field = \"region\"",
        );
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn test_zero_retention_rejected() {
        let toml = MINIMAL.replace(
            "table_name = \"iot_events\"",
            "table_name = \"iot_events\"\nretention_count = 0",
        );
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.conflict_max_attempts, 5);
        assert!(config.storage_max_attempts.is_none());
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 30_000);
        assert!(config.jitter);
    }

    #[test]
    fn test_default_monitoring_config() {
        let config = MonitoringConfig::default();
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_compression_names() {
        assert_eq!(ParquetCompression::Snappy.as_str(), "snappy");
        assert_eq!(ParquetCompression::None.as_str(), "uncompressed");
    }
}
