//! Azure Event Hubs queue backend (feature `azure-eventhubs`).
//!
//! The queue name maps to an event hub. One reader task per partition
//! feeds a channel; the consume loop drains it serially so the handler
//! contract matches the other drivers. Positions are tracked in memory
//! only; a restart resumes from the latest events, which is acceptable
//! under at-least-once with the request TTL as the backstop. Event Hubs
//! has no per-message ack, no delayed delivery (scheduled in-process),
//! and no cheap depth probe (`queue_depth` reports 0).

use async_trait::async_trait;
use azeventhubs::consumer::{
    EventHubConsumerClient, EventHubConsumerClientOptions, EventPosition, ReadEventOptions,
};
use azeventhubs::producer::{
    EventHubProducerClient, EventHubProducerClientOptions, SendEventOptions,
};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::error::{RelayError, Result};
use crate::queue::{MessageHandler, PublishOptions, QueueBackend, QueueMessage};

pub struct EventHubsQueue {
    connection_string: String,
    consumer_group: String,
    dlq_name: String,
    producer: tokio::sync::Mutex<Option<(String, EventHubProducerClient)>>,
    shutdown: CancellationToken,
}

impl EventHubsQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            connection_string: settings.azure_eventhubs_connection_string.clone(),
            consumer_group: settings.azure_eventhubs_consumer_group.clone(),
            dlq_name: settings.dlq_name.clone(),
            producer: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    async fn send(&self, queue: &str, body: String) -> Result<String> {
        let mut guard = self.producer.lock().await;
        // Producers are bound to one hub; reopen when the target changes.
        let reopen = !matches!(&*guard, Some((hub, _)) if hub == queue);
        if reopen {
            if let Some((_, old)) = guard.take() {
                let _ = old.close().await;
            }
            let producer = EventHubProducerClient::new_from_connection_string(
                self.connection_string.clone(),
                queue.to_string(),
                EventHubProducerClientOptions::default(),
            )
            .await
            .map_err(|e| {
                RelayError::transient_queue(format!("event hubs producer failed: {}", e))
            })?;
            *guard = Some((queue.to_string(), producer));
        }

        let (_, producer) = guard.as_mut().expect("producer just opened");
        producer
            .send_event(body.into_bytes(), SendEventOptions::default())
            .await
            .map_err(|e| RelayError::transient_queue(format!("event hubs send failed: {}", e)))?;
        Ok(format!("eh-{}", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl QueueBackend for EventHubsQueue {
    async fn connect(&self) -> Result<()> {
        if self.connection_string.is_empty() {
            return Err(RelayError::fatal_queue(
                "azure_eventhubs_connection_string is not set",
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some((_, producer)) = self.producer.lock().await.take() {
            let _ = producer.close().await;
        }
        info!("Disconnected from event hubs");
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &Value, opts: PublishOptions) -> Result<String> {
        let body = serde_json::to_string(message)?;

        if opts.delay_seconds > 0 {
            // No native delayed delivery; scheduled in-process with the
            // usual crash window.
            let connection_string = self.connection_string.clone();
            let queue = queue.to_string();
            let delay = opts.delay_seconds;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                let client = EventHubProducerClient::new_from_connection_string(
                    connection_string,
                    queue.clone(),
                    EventHubProducerClientOptions::default(),
                )
                .await;
                match client {
                    Ok(mut producer) => {
                        if let Err(e) = producer
                            .send_event(body.into_bytes(), SendEventOptions::default())
                            .await
                        {
                            error!("Delayed event hubs publish failed: {}", e);
                        }
                        let _ = producer.close().await;
                    }
                    Err(e) => error!("Delayed event hubs publish failed: {}", e),
                }
            });
            return Ok(format!("delayed-{}", uuid::Uuid::new_v4()));
        }

        let id = self.send(queue, body).await?;
        debug!("Published {} to event hub {}", id, queue);
        Ok(id)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        _batch_size: usize,
        _wait_time_seconds: u64,
    ) -> Result<()> {
        // Discover partitions with a short-lived client.
        let mut probe = EventHubConsumerClient::new_from_connection_string(
            self.consumer_group.clone(),
            self.connection_string.clone(),
            queue.to_string(),
            EventHubConsumerClientOptions::default(),
        )
        .await
        .map_err(|e| RelayError::transient_queue(format!("event hubs consumer failed: {}", e)))?;
        let partition_ids = probe
            .get_partition_ids()
            .await
            .map_err(|e| RelayError::transient_queue(format!("partition discovery failed: {}", e)))?;
        let _ = probe.close().await;

        info!(
            "Consuming event hub {} across {} partitions",
            queue,
            partition_ids.len()
        );

        let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, Vec<u8>)>(64);

        for partition_id in partition_ids {
            let tx = tx.clone();
            let connection_string = self.connection_string.clone();
            let consumer_group = self.consumer_group.clone();
            let hub = queue.to_string();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                let client = EventHubConsumerClient::new_from_connection_string(
                    consumer_group,
                    connection_string,
                    hub.clone(),
                    EventHubConsumerClientOptions::default(),
                )
                .await;
                let mut client = match client {
                    Ok(c) => c,
                    Err(e) => {
                        error!("Partition {} reader failed to start: {}", partition_id, e);
                        return;
                    }
                };

                let stream = client
                    .read_events_from_partition(
                        &partition_id,
                        EventPosition::latest(),
                        ReadEventOptions::default(),
                    )
                    .await;
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        error!("Partition {} read failed: {}", partition_id, e);
                        return;
                    }
                };
                let mut stream = Box::pin(stream);

                loop {
                    let event = tokio::select! {
                        e = stream.next() => e,
                        _ = shutdown.cancelled() => break,
                    };
                    let Some(event) = event else { break };
                    match event {
                        Ok(event) => match event.body() {
                            Ok(bytes) => {
                                if tx.send((partition_id.clone(), bytes.to_vec())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Event without readable body: {}", e),
                        },
                        Err(e) => {
                            error!("Partition {} read error: {}", partition_id, e);
                            break;
                        }
                    }
                }

                drop(stream);
                let _ = client.close().await;
            });
        }
        drop(tx);

        let mut sequence: u64 = 0;
        loop {
            let received = tokio::select! {
                r = rx.recv() => r,
                _ = self.shutdown.cancelled() => return Ok(()),
            };
            let Some((partition_id, bytes)) = received else {
                return Ok(());
            };

            sequence += 1;
            let message_id = format!("{}:{}:{}", queue, partition_id, sequence);

            let body: Value = match serde_json::from_slice(&bytes) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Undecodable event {}, dead-lettering: {}", message_id, e);
                    let raw = serde_json::json!({
                        "raw": String::from_utf8_lossy(&bytes),
                    });
                    self.publish(&self.dlq_name.clone(), &raw, PublishOptions::default())
                        .await?;
                    continue;
                }
            };

            let msg = QueueMessage::new(message_id.clone(), body.clone());
            match handler(msg).await {
                // The in-memory position is the checkpoint.
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    warn!("Handler failed transiently on {}: {}", message_id, e);
                    self.publish(queue, &body, PublishOptions::default()).await?;
                }
                Err(e) => {
                    warn!("Handler failed on {}, dead-lettering: {}", message_id, e);
                    self.publish(&self.dlq_name.clone(), &body, PublishOptions::default())
                        .await?;
                }
            }
        }
    }

    async fn acknowledge(&self, _message_id: &str) -> Result<bool> {
        // Event Hubs checkpoints positions instead of acking messages; the
        // consume loop advances its position on handler return.
        Ok(false)
    }

    async fn reject(&self, _message_id: &str, _requeue: bool, _reason: Option<&str>) -> Result<bool> {
        Ok(false)
    }

    async fn queue_depth(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }

    async fn health_check(&self) -> bool {
        !self.connection_string.is_empty() && !self.shutdown.is_cancelled()
    }
}
