//! Kafka source with explicit partition assignment.
//!
//! Positions are owned by the checkpoint, not the consumer group: the source
//! never commits offsets to Kafka and never joins a rebalance. `seek` assigns
//! every partition of the topic at the resolved start offset.
//!
//! With `fail_on_data_loss`, `auto.offset.reset` is set to `error` so offsets
//! deleted by retention while running surface as poll errors instead of a
//! silent jump.

use super::{SourceMessage, SourcePosition, StartPositions, StreamSource};
use crate::config::SourceConfig;
use crate::{Error, Result, SourceError};
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka-backed stream source.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    servers: String,
    fail_on_data_loss: bool,
    /// Messages taken off the stream by a poll that has not returned yet
    pending: Vec<SourceMessage>,
}

impl KafkaSource {
    /// Build the consumer. No partitions are assigned until `seek`.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let servers = config.bootstrap_servers.join(",");
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &servers)
            .set("group.id", &config.consumer_group)
            // Offsets live in the checkpoint; the group never stores them.
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                if config.fail_on_data_loss {
                    "error"
                } else {
                    "earliest"
                },
            )
            .set("session.timeout.ms", config.session_timeout_ms.to_string());

        if let Some(ref protocol) = config.security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = config.security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = config.security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = config.security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = config.security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
        }

        let consumer: StreamConsumer = client_config.create().map_err(|e| {
            Error::Source(SourceError::ConnectionFailed {
                broker: servers.clone(),
                message: e.to_string(),
            })
        })?;

        info!(
            topic = %config.topic,
            servers = %servers,
            fail_on_data_loss = config.fail_on_data_loss,
            "Kafka source created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
            servers,
            fail_on_data_loss: config.fail_on_data_loss,
            pending: Vec::new(),
        })
    }

    /// Partition ids and `(low, high)` watermarks for the topic.
    async fn partition_watermarks(&self) -> Result<Vec<(i32, i64, i64)>> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let servers = self.servers.clone();

        tokio::task::spawn_blocking(move || -> std::result::Result<Vec<(i32, i64, i64)>, SourceError> {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(|e| SourceError::ConnectionFailed {
                    broker: servers,
                    message: e.to_string(),
                })?;

            let partitions: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic)
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();

            if partitions.is_empty() {
                return Err(SourceError::Assignment(format!(
                    "Topic '{}' has no partitions",
                    topic
                )));
            }

            partitions
                .into_iter()
                .map(|partition| {
                    let (low, high) = consumer
                        .fetch_watermarks(&topic, partition, METADATA_TIMEOUT)
                        .map_err(|e| SourceError::Assignment(e.to_string()))?;
                    Ok((partition, low, high))
                })
                .collect()
        })
        .await
        .map_err(|e| Error::Source(SourceError::Assignment(e.to_string())))?
        .map_err(Error::from)
    }

    /// Convert a borrowed message to an owned SourceMessage.
    fn convert_message(msg: &BorrowedMessage) -> SourceMessage {
        SourceMessage {
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|v| v.to_vec()),
            position: SourcePosition::new(msg.topic(), msg.partition(), msg.offset()),
            timestamp_ms: msg.timestamp().to_millis(),
        }
    }
}

#[async_trait]
impl StreamSource for KafkaSource {
    fn describe(&self) -> String {
        format!("kafka://{}/{}", self.servers, self.topic)
    }

    async fn seek(&mut self, start: &StartPositions) -> Result<()> {
        let watermarks = self.partition_watermarks().await?;
        let mut tpl = TopicPartitionList::new();

        for (partition, low, high) in watermarks {
            let offset = match start {
                StartPositions::Earliest => Offset::Beginning,
                StartPositions::Latest => Offset::End,
                StartPositions::Offsets(offsets) => match offsets.get(&partition) {
                    Some(&requested) if requested < low => {
                        if self.fail_on_data_loss {
                            return Err(SourceError::DataLoss {
                                topic: self.topic.clone(),
                                partition,
                                requested,
                                earliest: low,
                            }
                            .into());
                        }
                        warn!(
                            topic = %self.topic,
                            partition = partition,
                            requested = requested,
                            earliest = low,
                            "Requested offset no longer retained, skipping ahead"
                        );
                        Offset::Offset(low)
                    }
                    Some(&requested) => Offset::Offset(requested.min(high)),
                    None => Offset::Beginning,
                },
            };

            debug!(partition = partition, low = low, high = high, offset = ?offset, "Assigning partition");
            tpl.add_partition_offset(&self.topic, partition, offset)
                .map_err(|e| SourceError::Assignment(e.to_string()))?;
        }

        self.consumer
            .assign(&tpl)
            .map_err(|e| SourceError::Assignment(e.to_string()))?;

        info!(topic = %self.topic, partitions = tpl.count(), "Kafka source positioned");
        Ok(())
    }

    async fn poll_batch(&mut self, max: usize, timeout: Duration) -> Result<Vec<SourceMessage>> {
        use futures::StreamExt;

        let deadline = tokio::time::Instant::now() + timeout;
        let consumer = self.consumer.clone();
        let stream = consumer.stream();
        tokio::pin!(stream);

        // Messages are parked on `self` until returned, so a cancelled poll
        // hands them to the next one.
        while self.pending.len() < max {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(msg))) => self.pending.push(Self::convert_message(&msg)),
                Ok(Some(Err(e))) => {
                    return Err(SourceError::Poll(e.to_string()).into());
                }
                Ok(None) | Err(_) => break,
            }
        }

        let take = self.pending.len().min(max);
        Ok(self.pending.drain(..take).collect())
    }

    fn is_exhausted(&self) -> bool {
        false
    }

    async fn close(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            debug!(
                discarded = self.pending.len(),
                "Discarding unreturned messages, they lie past the checkpoint"
            );
            self.pending.clear();
        }
        self.consumer
            .unassign()
            .map_err(|e| SourceError::Assignment(e.to_string()))?;
        info!(topic = %self.topic, "Kafka source closed");
        Ok(())
    }
}
