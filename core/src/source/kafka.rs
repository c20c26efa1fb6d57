use anyhow::{Context, Result};
use futures::stream::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::KafkaOptions;
use crate::errors::{KafkaError, SourceError};
use crate::source::{CheckpointHandle, MessageBatch, Source, SourceMessage};

const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

pub struct KafkaSource {
    client: KafkaConsumerClient,
    batch_size: usize,
    batch_timeout_ms: u64,
}

impl KafkaSource {
    pub async fn new(config: &KafkaOptions) -> Result<Self> {
        let client = KafkaConsumerClient::new(config)?;
        client.subscribe().await?;

        Ok(Self {
            client,
            batch_size: config
                .max_poll_records
                .map_or(DEFAULT_BATCH_SIZE, |n| n as usize),
            batch_timeout_ms: config.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
        })
    }
}

impl Source for KafkaSource {
    async fn next_batch(&self) -> std::result::Result<MessageBatch, SourceError> {
        let messages = self
            .client
            .consume_batch(self.batch_size, self.batch_timeout_ms)
            .await
            .map_err(|e| SourceError::Connection {
                source: Box::new(KafkaError::Consumption {
                    reason: e.to_string(),
                }),
            })?;

        let mut batch = MessageBatch {
            messages: Vec::with_capacity(messages.len()),
            handles: Vec::with_capacity(messages.len()),
        };
        for kafka_msg in messages {
            let checkpoint = KafkaCheckpoint {
                topic: kafka_msg.topic.clone(),
                partition: kafka_msg.partition,
                offset: kafka_msg.offset,
            };
            // Tombstones carry nothing to ingest but still advance the offset.
            batch.handles.push(checkpoint.to_bytes());
            if let Some(payload) = kafka_msg.payload {
                batch.messages.push(SourceMessage {
                    payload,
                    topic: kafka_msg.topic,
                    partition: kafka_msg.partition as usize,
                    headers: kafka_msg.headers,
                });
            }
        }
        Ok(batch)
    }

    async fn commit(&self, handles: &[CheckpointHandle]) -> std::result::Result<(), SourceError> {
        if handles.is_empty() {
            return Ok(());
        }

        let checkpoints: Vec<KafkaCheckpoint> = handles
            .iter()
            .filter_map(|handle| KafkaCheckpoint::from_bytes(handle))
            .collect();
        if checkpoints.len() != handles.len() {
            return Err(SourceError::Unrecoverable(Box::new(
                KafkaError::OffsetCommit {
                    reason: "Invalid checkpoint handles".to_string(),
                },
            )));
        }

        self.client
            .commit_offsets(&checkpoints)
            .map_err(|e| SourceError::Connection {
                source: Box::new(KafkaError::OffsetCommit {
                    reason: e.to_string(),
                }),
            })
    }

    async fn shutdown(&self) -> std::result::Result<(), SourceError> {
        self.client.consumer.unsubscribe();
        info!("Kafka consumer unsubscribed");
        Ok(())
    }
}

pub struct KafkaConsumerClient {
    consumer: StreamConsumer,
    config: KafkaOptions,
}

#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, Vec<u8>>,
}

impl KafkaConsumerClient {
    pub fn new(config: &KafkaOptions) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set(
                "auto.offset.reset",
                config.auto_offset_reset.as_deref().unwrap_or("earliest"),
            );

        if let Some(timeout) = config.session_timeout_ms {
            client_config.set("session.timeout.ms", timeout.to_string());
        }

        if let Some(heartbeat) = config.heartbeat_interval_ms {
            client_config.set("heartbeat.interval.ms", heartbeat.to_string());
        }

        if let Some(security_protocol) = &config.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &config.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &config.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &config.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        let consumer: StreamConsumer = client_config.create().map_err(|e| KafkaError::ConsumerCreation {
            reason: e.to_string(),
        })?;

        Ok(Self {
            consumer,
            config: config.clone(),
        })
    }

    pub async fn subscribe(&self) -> Result<()> {
        let topics: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| KafkaError::Subscription {
                topics: self.config.topics.join(","),
                reason: e.to_string(),
            })?;

        info!(topics = ?self.config.topics, "Subscribed to Kafka topics");
        Ok(())
    }

    /// Collects up to `batch_size` messages, giving up after `timeout_ms`.
    pub async fn consume_batch(
        &self,
        batch_size: usize,
        timeout_ms: u64,
    ) -> Result<Vec<KafkaMessage>> {
        let mut messages = Vec::new();
        let batch_timeout = Duration::from_millis(timeout_ms);
        let start_time = Instant::now();
        let mut stream = self.consumer.stream();

        while messages.len() < batch_size {
            let Some(remaining) = batch_timeout.checked_sub(start_time.elapsed()) else {
                break;
            };
            match timeout(remaining, stream.next()).await {
                Ok(Some(Ok(message))) => {
                    debug!(
                        partition = message.partition(),
                        offset = message.offset(),
                        "Received message"
                    );
                    messages.push(convert_message(&message));
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Error receiving message");
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if !messages.is_empty() {
            debug!(messages = messages.len(), "Consumed batch");
        }

        Ok(messages)
    }

    /// Commits, per partition, the offset after the highest checkpoint seen.
    pub fn commit_offsets(&self, checkpoints: &[KafkaCheckpoint]) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in latest_offsets(checkpoints) {
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .context("Failed to commit offsets")?;

        debug!(partitions = tpl.count(), "Committed offsets");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        for topic in &self.config.topics {
            let metadata = self
                .consumer
                .fetch_metadata(Some(topic), Duration::from_secs(10))
                .context("Failed to fetch metadata for health check")?;

            let partitions = metadata
                .topics()
                .first()
                .map_or(0, |t| t.partitions().len());
            if partitions == 0 {
                return Err(anyhow::anyhow!("No partitions found for topic {}", topic));
            }
            info!(topic, partitions, "Health check passed");
        }
        Ok(())
    }
}

fn convert_message(message: &BorrowedMessage<'_>) -> KafkaMessage {
    let mut headers = HashMap::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), value.to_vec());
            }
        }
    }

    KafkaMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp: message.timestamp().to_millis(),
        headers,
    }
}

fn latest_offsets(checkpoints: &[KafkaCheckpoint]) -> BTreeMap<(&str, i32), i64> {
    let mut latest = BTreeMap::new();
    for checkpoint in checkpoints {
        latest
            .entry((checkpoint.topic.as_str(), checkpoint.partition))
            .and_modify(|offset: &mut i64| *offset = (*offset).max(checkpoint.offset))
            .or_insert(checkpoint.offset);
    }
    latest
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaCheckpoint {
    topic: String,
    partition: i32,
    offset: i64,
}

impl KafkaCheckpoint {
    fn to_bytes(&self) -> Vec<u8> {
        // topic length + topic + partition + offset
        let mut bytes = Vec::with_capacity(16 + self.topic.len());
        bytes.extend_from_slice(&(self.topic.len() as u32).to_le_bytes());
        bytes.extend_from_slice(self.topic.as_bytes());
        bytes.extend_from_slice(&self.partition.to_le_bytes());
        bytes.extend_from_slice(&self.offset.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        // Minimum length: 4 (topic len) + 4 (partition) + 8 (offset)
        if bytes.len() < 16 {
            return None;
        }

        let topic_len = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
        if bytes.len() != 16 + topic_len {
            return None;
        }

        let topic = String::from_utf8(bytes[4..4 + topic_len].to_vec()).ok()?;
        let partition = i32::from_le_bytes(bytes[4 + topic_len..8 + topic_len].try_into().ok()?);
        let offset = i64::from_le_bytes(bytes[8 + topic_len..16 + topic_len].try_into().ok()?);

        Some(Self {
            topic,
            partition,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    const TEST_TOPIC: &str = "test-topic";
    const TEST_GROUP: &str = "test-group";
    const KAFKA_BOOTSTRAP_SERVERS: &str = "localhost:9092";

    fn checkpoint(topic: &str, partition: i32, offset: i64) -> KafkaCheckpoint {
        KafkaCheckpoint {
            topic: topic.to_string(),
            partition,
            offset,
        }
    }

    fn options() -> KafkaOptions {
        KafkaOptions {
            bootstrap_servers: KAFKA_BOOTSTRAP_SERVERS.to_string(),
            topics: vec![TEST_TOPIC.to_string()],
            consumer_group: TEST_GROUP.to_string(),
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            auto_offset_reset: Some("earliest".to_string()),
            session_timeout_ms: Some(6000),
            heartbeat_interval_ms: None,
            max_poll_records: Some(5),
            poll_timeout_ms: Some(2000),
        }
    }

    #[test]
    fn test_checkpoint_bytes() {
        let original = checkpoint("events", 3, 42);
        let bytes = original.to_bytes();
        assert_eq!(bytes.len(), 16 + "events".len());
        assert_eq!(KafkaCheckpoint::from_bytes(&bytes), Some(original));

        assert_eq!(KafkaCheckpoint::from_bytes(&bytes[..10]), None);
        let mut padded = bytes.clone();
        padded.push(0);
        assert_eq!(KafkaCheckpoint::from_bytes(&padded), None);
    }

    #[test]
    fn test_latest_offsets_per_partition() {
        let checkpoints = vec![
            checkpoint("a", 0, 5),
            checkpoint("a", 1, 2),
            checkpoint("a", 0, 9),
            checkpoint("b", 0, 1),
            checkpoint("a", 0, 7),
        ];
        let latest = latest_offsets(&checkpoints);
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[&("a", 0)], 9);
        assert_eq!(latest[&("a", 1)], 2);
        assert_eq!(latest[&("b", 0)], 1);
    }

    #[tokio::test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    async fn test_kafka_source_consume_and_commit() {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");
        for i in 0..3 {
            let payload = format!("message-{}", i);
            producer
                .send(
                    FutureRecord::to(TEST_TOPIC).payload(&payload).key(&i.to_string()),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to send message");
        }

        let source = KafkaSource::new(&options())
            .await
            .expect("Failed to create source");
        source.client.health_check().await.expect("Health check should pass");

        let batch = source.next_batch().await.expect("Failed to poll");
        assert!(!batch.is_empty());
        assert_eq!(batch.handles.len(), batch.len());
        source.commit(&batch.handles).await.expect("Failed to commit");
        source.shutdown().await.expect("Failed to shut down");
    }
}
