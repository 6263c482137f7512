//! MQTT queue backend (feature `mqtt`).
//!
//! Queues map to topics; delivery uses the configured QoS (1 by default)
//! with manual protocol acks. MQTT brokers expose no queue depth
//! (`queue_depth` reports 0), no per-topic DLQ (rejected messages are
//! republished to the DLQ topic), and no delayed delivery (scheduled
//! in-process).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::error::{RelayError, Result};
use crate::queue::{MessageHandler, PublishOptions, QueueBackend, QueueMessage};

pub struct MqttQueue {
    host: String,
    port: u16,
    username: String,
    password: String,
    qos: QoS,
    client_id: String,
    dlq_name: String,
    client: parking_lot::Mutex<Option<AsyncClient>>,
    incoming: tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<Publish>>>,
    unacked: parking_lot::Mutex<HashMap<String, Publish>>,
    shutdown: CancellationToken,
}

impl MqttQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        let qos = match settings.mqtt_qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        };
        let client_id = if settings.mqtt_client_id.is_empty() {
            format!("relayq-{}", uuid::Uuid::new_v4())
        } else {
            settings.mqtt_client_id.clone()
        };
        Self {
            host: settings.mqtt_broker_host.clone(),
            port: settings.mqtt_broker_port,
            username: settings.mqtt_username.clone(),
            password: settings.mqtt_password.clone(),
            qos,
            client_id,
            dlq_name: settings.dlq_name.clone(),
            client: parking_lot::Mutex::new(None),
            incoming: tokio::sync::Mutex::new(None),
            unacked: parking_lot::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| RelayError::fatal_queue("not connected to mqtt broker"))
    }

    async fn send(&self, topic: &str, body: String) -> Result<String> {
        let client = self.client()?;
        client
            .publish(topic, self.qos, false, body)
            .await
            .map_err(|e| RelayError::transient_queue(format!("mqtt publish failed: {}", e)))?;
        Ok(format!("mqtt-{}", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl QueueBackend for MqttQueue {
    async fn connect(&self) -> Result<()> {
        if self.client.lock().is_some() {
            return Ok(());
        }

        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_manual_acks(true);
        if !self.username.is_empty() {
            options.set_credentials(self.username.clone(), self.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = tokio::sync::mpsc::channel::<Publish>(64);

        // The event loop must be polled for both directions of traffic.
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    e = eventloop.poll() => e,
                    _ = shutdown.cancelled() => break,
                };
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if tx.send(publish).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        *self.client.lock() = Some(client);
        *self.incoming.lock().await = Some(rx);
        info!("Connected to mqtt broker {}:{}", self.host, self.port);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(client) = self.client.lock().take() {
            let _ = client.disconnect().await;
        }
        self.incoming.lock().await.take();
        info!("Disconnected from mqtt broker");
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &Value, opts: PublishOptions) -> Result<String> {
        let body = serde_json::to_string(message)?;

        if opts.delay_seconds > 0 {
            let client = self.client()?;
            let topic = queue.to_string();
            let qos = self.qos;
            let delay = opts.delay_seconds;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                if let Err(e) = client.publish(topic, qos, false, body).await {
                    error!("Delayed mqtt publish failed: {}", e);
                }
            });
            return Ok(format!("delayed-{}", uuid::Uuid::new_v4()));
        }

        let id = self.send(queue, body).await?;
        debug!("Published {} to mqtt topic {}", id, queue);
        Ok(id)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        _batch_size: usize,
        _wait_time_seconds: u64,
    ) -> Result<()> {
        let client = self.client()?;
        client
            .subscribe(queue, self.qos)
            .await
            .map_err(|e| RelayError::transient_queue(format!("mqtt subscribe failed: {}", e)))?;

        let mut rx = self
            .incoming
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::fatal_queue("mqtt consume already running"))?;
        info!("Consuming mqtt topic {}", queue);

        let mut sequence: u64 = 0;
        loop {
            let publish = tokio::select! {
                p = rx.recv() => p,
                _ = self.shutdown.cancelled() => return Ok(()),
            };
            let Some(publish) = publish else {
                return Ok(());
            };
            if publish.topic != queue {
                // Another subscription on the shared connection.
                let _ = client.ack(&publish).await;
                continue;
            }

            sequence += 1;
            let message_id = format!("{}:{}:{}", queue, publish.pkid, sequence);

            let body: Value = match serde_json::from_slice(&publish.payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Undecodable message {}, dead-lettering: {}", message_id, e);
                    let raw = serde_json::json!({
                        "raw": String::from_utf8_lossy(&publish.payload),
                    });
                    self.publish(&self.dlq_name.clone(), &raw, PublishOptions::default())
                        .await?;
                    let _ = client.ack(&publish).await;
                    continue;
                }
            };

            self.unacked
                .lock()
                .insert(message_id.clone(), publish.clone());

            let msg = QueueMessage::new(message_id.clone(), body.clone());
            match handler(msg).await {
                Ok(()) => {
                    self.unacked.lock().remove(&message_id);
                    let _ = client.ack(&publish).await;
                }
                Err(e) if e.is_transient() => {
                    warn!("Handler failed transiently on {}: {}", message_id, e);
                    self.unacked.lock().remove(&message_id);
                    self.publish(queue, &body, PublishOptions::default()).await?;
                    let _ = client.ack(&publish).await;
                }
                Err(e) => {
                    warn!("Handler failed on {}, dead-lettering: {}", message_id, e);
                    self.unacked.lock().remove(&message_id);
                    self.publish(&self.dlq_name.clone(), &body, PublishOptions::default())
                        .await?;
                    let _ = client.ack(&publish).await;
                }
            }
        }
    }

    async fn acknowledge(&self, message_id: &str) -> Result<bool> {
        let Some(publish) = self.unacked.lock().remove(message_id) else {
            return Ok(false);
        };
        let client = self.client()?;
        client
            .ack(&publish)
            .await
            .map_err(|e| RelayError::transient_queue(format!("mqtt ack failed: {}", e)))?;
        Ok(true)
    }

    async fn reject(&self, message_id: &str, requeue: bool, reason: Option<&str>) -> Result<bool> {
        let Some(publish) = self.unacked.lock().remove(message_id) else {
            return Ok(false);
        };
        let body: Value = serde_json::from_slice(&publish.payload).unwrap_or_else(|_| {
            serde_json::json!({"raw": String::from_utf8_lossy(&publish.payload)})
        });

        if requeue {
            self.publish(&publish.topic.clone(), &body, PublishOptions::default())
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

        let client = self.client()?;
        let _ = client.ack(&publish).await;
        Ok(true)
    }

    async fn queue_depth(&self, _queue: &str) -> Result<u64> {
        Ok(0)
    }

    async fn health_check(&self) -> bool {
        self.client.lock().is_some() && !self.shutdown.is_cancelled()
    }
}
