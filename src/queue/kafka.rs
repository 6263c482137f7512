//! Apache Kafka queue backend.
//!
//! Messages are keyed by partition key (falling back to correlation id) so
//! Kafka's own hashing preserves per-key ordering. Offsets are committed
//! only after the handler returns; auto-commit is disabled.
//!
//! Kafka has no native delayed delivery; a publish with a delay is
//! scheduled in-process, with the same crash window as the redis driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::error::{RelayError, Result};
use crate::queue::{MessageHandler, PublishOptions, QueueBackend, QueueMessage};

pub struct KafkaQueue {
    brokers: String,
    group: String,
    dlq_name: String,
    producer: parking_lot::Mutex<Option<FutureProducer>>,
    active_consumer: parking_lot::Mutex<Option<Arc<StreamConsumer>>>,
    unacked: parking_lot::Mutex<HashMap<String, Value>>,
    shutdown: CancellationToken,
}

impl KafkaQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            brokers: settings.kafka_bootstrap_servers.clone(),
            group: settings.kafka_consumer_group.clone(),
            dlq_name: settings.dlq_name.clone(),
            producer: parking_lot::Mutex::new(None),
            active_consumer: parking_lot::Mutex::new(None),
            unacked: parking_lot::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn producer(&self) -> Result<FutureProducer> {
        self.producer
            .lock()
            .clone()
            .ok_or_else(|| RelayError::fatal_queue("not connected to kafka"))
    }

    fn message_id(topic: &str, partition: i32, offset: i64) -> String {
        format!("{}:{}:{}", topic, partition, offset)
    }

    fn parse_message_id(message_id: &str) -> Result<(String, i32, i64)> {
        let mut parts = message_id.rsplitn(3, ':');
        let offset = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RelayError::fatal_queue("malformed kafka message id"))?;
        let partition = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RelayError::fatal_queue("malformed kafka message id"))?;
        let topic = parts
            .next()
            .ok_or_else(|| RelayError::fatal_queue("malformed kafka message id"))?;
        Ok((topic.to_string(), partition, offset))
    }

    async fn send(&self, queue: &str, key: &str, body: &str) -> Result<String> {
        let producer = self.producer()?;
        let record = FutureRecord::to(queue).payload(body).key(key);
        let (partition, offset) = producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| RelayError::transient_queue(format!("kafka send failed: {}", e)))?;
        Ok(Self::message_id(queue, partition, offset))
    }

    fn commit_offset(&self, message_id: &str) -> Result<bool> {
        let Some(consumer) = self.active_consumer.lock().clone() else {
            return Ok(false);
        };
        let (topic, partition, offset) = Self::parse_message_id(message_id)?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
            .map_err(RelayError::from)?;
        consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(RelayError::from)?;
        Ok(true)
    }
}

#[async_trait]
impl QueueBackend for KafkaQueue {
    async fn connect(&self) -> Result<()> {
        if self.producer.lock().is_some() {
            return Ok(());
        }
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| RelayError::fatal_queue(format!("failed to create producer: {}", e)))?;
        *self.producer.lock() = Some(producer);
        info!("Connected to kafka brokers {}", self.brokers);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown.cancel();
        self.producer.lock().take();
        self.active_consumer.lock().take();
        info!("Disconnected from kafka");
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &Value, opts: PublishOptions) -> Result<String> {
        let body = serde_json::to_string(message)?;
        let key = opts
            .attributes
            .get("partition_key")
            .cloned()
            .or_else(|| {
                message
                    .get("correlation_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
            })
            .unwrap_or_default();

        if opts.delay_seconds > 0 {
            let producer = self.producer()?;
            let queue = queue.to_string();
            let delay = opts.delay_seconds;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                let record = FutureRecord::to(&queue).payload(&body).key(&key);
                if let Err((e, _)) = producer.send(record, Duration::from_secs(5)).await {
                    error!("Delayed publish to {} failed: {}", queue, e);
                }
            });
            return Ok(format!("delayed-{}", uuid::Uuid::new_v4()));
        }

        let id = self.send(queue, &key, &body).await?;
        debug!("Published {} to topic {}", id, queue);
        Ok(id)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        _batch_size: usize,
        _wait_time_seconds: u64,
    ) -> Result<()> {
        // Fetch batching is librdkafka's own concern; the stream yields one
        // message at a time regardless.
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| RelayError::fatal_queue(format!("failed to create consumer: {}", e)))?;
        consumer
            .subscribe(&[queue])
            .map_err(|e| RelayError::fatal_queue(format!("failed to subscribe: {}", e)))?;

        let consumer = Arc::new(consumer);
        *self.active_consumer.lock() = Some(consumer.clone());
        info!("Consuming topic {} in group {}", queue, self.group);

        loop {
            let message = tokio::select! {
                m = consumer.recv() => m,
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    error!("Error receiving from topic {}: {}", queue, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let message_id = Self::message_id(queue, message.partition(), message.offset());
            let payload = message.payload().unwrap_or_default();

            let body: Value = match serde_json::from_slice(payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Undecodable message {}, dead-lettering: {}", message_id, e);
                    let raw = serde_json::json!({
                        "raw": String::from_utf8_lossy(payload),
                    });
                    self.publish(&self.dlq_name.clone(), &raw, PublishOptions::default())
                        .await?;
                    consumer.commit_message(&message, CommitMode::Async)?;
                    continue;
                }
            };

            self.unacked.lock().insert(message_id.clone(), body.clone());

            let msg = QueueMessage::new(message_id.clone(), body);
            match handler(msg).await {
                Ok(()) => {
                    self.unacked.lock().remove(&message_id);
                    consumer.commit_message(&message, CommitMode::Async)?;
                }
                Err(e) if e.is_transient() => {
                    warn!("Handler failed transiently on {}: {}", message_id, e);
                    self.reject(&message_id, true, Some(&e.to_string())).await?;
                    consumer.commit_message(&message, CommitMode::Async)?;
                }
                Err(e) => {
                    warn!("Handler failed on {}, dead-lettering: {}", message_id, e);
                    self.reject(&message_id, false, Some(&e.to_string())).await?;
                    consumer.commit_message(&message, CommitMode::Async)?;
                }
            }
        }
    }

    async fn acknowledge(&self, message_id: &str) -> Result<bool> {
        self.unacked.lock().remove(message_id);
        self.commit_offset(message_id)
    }

    async fn reject(&self, message_id: &str, requeue: bool, reason: Option<&str>) -> Result<bool> {
        let Some(body) = self.unacked.lock().remove(message_id) else {
            return Ok(false);
        };
        let (topic, _, _) = Self::parse_message_id(message_id)
            .unwrap_or_else(|_| (self.dlq_name.clone(), 0, 0));
        if requeue {
            // Kafka cannot redeliver past a committed offset, so requeue is
            // a republish at the tail of the topic.
            self.publish(&topic, &body, PublishOptions::default())
                .await?;
        } else {
            let mut dead = body;
            if let (Some(obj), Some(reason)) = (dead.as_object_mut(), reason) {
                obj.insert(
                    "reject_reason".to_string(),
                    Value::String(reason.to_string()),
                );
            }
            self.publish(&self.dlq_name.clone(), &dead, PublishOptions::default())
                .await?;
        }
        Ok(true)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        // Best effort: high watermarks minus committed offsets on the
        // active consumer. Without an active consumer, 0.
        let Some(consumer) = self.active_consumer.lock().clone() else {
            return Ok(0);
        };
        let timeout = Duration::from_secs(5);
        let metadata = consumer
            .fetch_metadata(Some(queue), timeout)
            .map_err(RelayError::from)?;

        let mut depth: i64 = 0;
        for topic in metadata.topics() {
            for partition in topic.partitions() {
                let (low, high) = consumer
                    .fetch_watermarks(queue, partition.id(), timeout)
                    .map_err(RelayError::from)?;

                let mut tpl = TopicPartitionList::new();
                tpl.add_partition(queue, partition.id());
                let committed = consumer
                    .committed_offsets(tpl, timeout)
                    .map_err(RelayError::from)?;
                let position = committed
                    .elements()
                    .first()
                    .map(|e| match e.offset() {
                        Offset::Offset(o) => o,
                        _ => low,
                    })
                    .unwrap_or(low);

                depth += (high - position).max(0);
            }
        }
        Ok(depth as u64)
    }

    async fn health_check(&self) -> bool {
        let Ok(producer) = self.producer() else {
            return false;
        };
        use rdkafka::producer::Producer;
        producer
            .client()
            .fetch_metadata(None, Duration::from_secs(2))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_round_trip() {
        let id = KafkaQueue::message_id("relayq-requests", 3, 42);
        assert_eq!(id, "relayq-requests:3:42");
        let (topic, partition, offset) = KafkaQueue::parse_message_id(&id).unwrap();
        assert_eq!(topic, "relayq-requests");
        assert_eq!(partition, 3);
        assert_eq!(offset, 42);
    }

    #[test]
    fn malformed_message_id_rejected() {
        assert!(KafkaQueue::parse_message_id("nope").is_err());
        assert!(KafkaQueue::parse_message_id("topic:notanint:7").is_err());
    }
}
