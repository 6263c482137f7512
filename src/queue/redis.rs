//! Redis Streams queue backend.
//!
//! One stream per queue, one consumer group shared by all workers.
//! `XREADGROUP` delivers, `XACK` acknowledges. Depth is the stream length
//! (approximate: it counts trimmed-but-retained entries as well).
//!
//! Redis Streams have no native delayed delivery; a publish with a delay is
//! scheduled in-process. A crash during the delay window drops the
//! republish, after which the request record expires on its own.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::error::{RelayError, Result};
use crate::queue::{MessageHandler, PublishOptions, QueueBackend, QueueMessage};

pub struct RedisQueue {
    url: String,
    group: String,
    consumer_name: String,
    dlq_name: String,
    connection: parking_lot::Mutex<Option<ConnectionManager>>,
    unacked: parking_lot::Mutex<HashMap<String, (String, Value)>>,
    shutdown: CancellationToken,
}

impl RedisQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            url: settings.redis_url.clone(),
            group: settings.redis_consumer_group.clone(),
            consumer_name: format!("consumer-{}", uuid::Uuid::new_v4()),
            dlq_name: settings.dlq_name.clone(),
            connection: parking_lot::Mutex::new(None),
            unacked: parking_lot::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn conn(&self) -> Result<ConnectionManager> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| RelayError::fatal_queue("not connected to redis"))
    }

    async fn ensure_group(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let created: std::result::Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(queue, &self.group, "$")
            .await;
        match created {
            Ok(()) => {
                info!("Created consumer group {} on stream {}", self.group, queue);
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(RelayError::transient_queue(format!(
                "failed to create consumer group: {}",
                e
            ))),
        }
    }

    async fn xadd(&self, queue: &str, body: &str) -> Result<String> {
        let mut conn = self.conn()?;
        let id: String = conn
            .xadd(queue, "*", &[("payload", body)])
            .await
            .map_err(|e| RelayError::transient_queue(format!("XADD failed: {}", e)))?;
        Ok(id)
    }

    async fn xack(&self, queue: &str, message_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let acked: i64 = conn
            .xack(queue, &self.group, &[message_id])
            .await
            .map_err(|e| RelayError::transient_queue(format!("XACK failed: {}", e)))?;
        Ok(acked > 0)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn connect(&self) -> Result<()> {
        if self.connection.lock().is_some() {
            return Ok(());
        }
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| RelayError::fatal_queue(format!("invalid redis url: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| RelayError::transient_queue(format!("failed to connect: {}", e)))?;
        *self.connection.lock() = Some(manager);
        info!("Connected to redis broker at {}", self.url);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown.cancel();
        self.connection.lock().take();
        info!("Disconnected from redis broker");
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &Value, opts: PublishOptions) -> Result<String> {
        let body = serde_json::to_string(message)?;

        if opts.delay_seconds > 0 {
            // In-process delay; see the module docs for the crash window.
            let this_conn = self.conn()?;
            let queue = queue.to_string();
            let delay = opts.delay_seconds;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                let mut conn = this_conn;
                let added: std::result::Result<String, redis::RedisError> =
                    conn.xadd(&queue, "*", &[("payload", body.as_str())]).await;
                if let Err(e) = added {
                    error!("Delayed publish to {} failed: {}", queue, e);
                }
            });
            return Ok(format!("delayed-{}", uuid::Uuid::new_v4()));
        }

        let id = self.xadd(queue, &body).await?;
        debug!("Published {} to stream {}", id, queue);
        Ok(id)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        batch_size: usize,
        wait_time_seconds: u64,
    ) -> Result<()> {
        self.ensure_group(queue).await?;
        let block_ms = (wait_time_seconds.max(1) * 1000).min(5_000) as usize;
        info!(
            "Consuming stream {} as {} in group {}",
            queue, self.consumer_name, self.group
        );

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let mut conn = match self.conn() {
                Ok(conn) => conn,
                // Disconnect raced the loop; treat it as a clean stop.
                Err(_) if self.shutdown.is_cancelled() => return Ok(()),
                Err(e) => return Err(e),
            };
            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer_name)
                .count(batch_size.max(1))
                .block(block_ms);

            let queue_keys = [queue];
            let reply: StreamReadReply = tokio::select! {
                r = conn.xread_options(&queue_keys, &[">"], &opts) => match r {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!("Error reading from stream {}: {}", queue, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            for stream in reply.keys {
                for entry in stream.ids {
                    let message_id = entry.id.clone();
                    let Some(payload) = entry.get::<String>("payload") else {
                        warn!("Stream entry {} has no payload field, acking", message_id);
                        self.xack(queue, &message_id).await?;
                        continue;
                    };

                    let body: Value = match serde_json::from_str(&payload) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("Undecodable entry {}, dead-lettering: {}", message_id, e);
                            let raw = serde_json::json!({"raw": payload});
                            self.xadd(&self.dlq_name.clone(), &raw.to_string()).await?;
                            self.xack(queue, &message_id).await?;
                            continue;
                        }
                    };

                    self.unacked
                        .lock()
                        .insert(message_id.clone(), (queue.to_string(), body.clone()));

                    let msg = QueueMessage::new(message_id.clone(), body);
                    match handler(msg).await {
                        Ok(()) => {
                            self.acknowledge(&message_id).await?;
                        }
                        Err(e) if e.is_transient() => {
                            warn!("Handler failed transiently on {}: {}", message_id, e);
                            self.reject(&message_id, true, Some(&e.to_string())).await?;
                        }
                        Err(e) => {
                            warn!("Handler failed on {}, dead-lettering: {}", message_id, e);
                            self.reject(&message_id, false, Some(&e.to_string())).await?;
                        }
                    }
                }
            }
        }
    }

    async fn acknowledge(&self, message_id: &str) -> Result<bool> {
        let Some((queue, _)) = self.unacked.lock().remove(message_id) else {
            return Ok(false);
        };
        self.xack(&queue, message_id).await
    }

    async fn reject(&self, message_id: &str, requeue: bool, reason: Option<&str>) -> Result<bool> {
        let Some((queue, body)) = self.unacked.lock().remove(message_id) else {
            return Ok(false);
        };
        if requeue {
            self.xadd(&queue, &serde_json::to_string(&body)?).await?;
        } else {
            let mut dead = body;
            if let (Some(obj), Some(reason)) = (dead.as_object_mut(), reason) {
                obj.insert(
                    "reject_reason".to_string(),
                    Value::String(reason.to_string()),
                );
            }
            self.xadd(&self.dlq_name.clone(), &serde_json::to_string(&dead)?)
                .await?;
        }
        self.xack(&queue, message_id).await
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn()?;
        let len: u64 = conn
            .xlen(queue)
            .await
            .map_err(|e| RelayError::transient_queue(format!("XLEN failed: {}", e)))?;
        Ok(len)
    }

    async fn health_check(&self) -> bool {
        let Ok(mut conn) = self.conn() else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}
