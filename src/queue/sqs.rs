//! AWS SQS queue backend (feature `sqs`).
//!
//! Standard queues only: no ordering guarantee, per-message receipt
//! handles, native `DelaySeconds` support, and depth from
//! `ApproximateNumberOfMessages`. SQS has no DLQ publish primitive of its
//! own here; rejected-without-requeue messages are forwarded to the
//! configured DLQ queue like on the other drivers (redrive policies remain
//! an operator choice).

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageAttributeValue, QueueAttributeName};
use aws_sdk_sqs::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::error::{RelayError, Result};
use crate::queue::{MessageHandler, PublishOptions, QueueBackend, QueueMessage};

struct Unacked {
    queue_url: String,
    receipt_handle: String,
    body: Value,
}

pub struct SqsQueue {
    region: String,
    endpoint_url: Option<String>,
    dlq_name: String,
    client: parking_lot::Mutex<Option<Client>>,
    queue_urls: parking_lot::Mutex<HashMap<String, String>>,
    unacked: parking_lot::Mutex<HashMap<String, Unacked>>,
    shutdown: CancellationToken,
}

impl SqsQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            region: settings.sqs_region.clone(),
            endpoint_url: settings.sqs_endpoint_url.clone(),
            dlq_name: settings.dlq_name.clone(),
            client: parking_lot::Mutex::new(None),
            queue_urls: parking_lot::Mutex::new(HashMap::new()),
            unacked: parking_lot::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| RelayError::fatal_queue("not connected to sqs"))
    }

    async fn queue_url(&self, queue: &str) -> Result<String> {
        if let Some(url) = self.queue_urls.lock().get(queue) {
            return Ok(url.clone());
        }
        let client = self.client()?;
        let url = client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| RelayError::fatal_queue(format!("unknown sqs queue '{}': {}", queue, e)))?
            .queue_url()
            .ok_or_else(|| RelayError::fatal_queue(format!("no url for sqs queue '{}'", queue)))?
            .to_string();
        self.queue_urls
            .lock()
            .insert(queue.to_string(), url.clone());
        Ok(url)
    }
}

#[async_trait]
impl QueueBackend for SqsQueue {
    async fn connect(&self) -> Result<()> {
        if self.client.lock().is_some() {
            return Ok(());
        }
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()));
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        *self.client.lock() = Some(Client::new(&sdk_config));
        info!("Connected to sqs in region {}", self.region);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown.cancel();
        self.client.lock().take();
        info!("Disconnected from sqs");
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &Value, opts: PublishOptions) -> Result<String> {
        let client = self.client()?;
        let queue_url = self.queue_url(queue).await?;
        let body = serde_json::to_string(message)?;

        let mut request = client
            .send_message()
            .queue_url(&queue_url)
            .message_body(body)
            // SQS caps DelaySeconds at 15 minutes.
            .delay_seconds(opts.delay_seconds.min(900) as i32);

        for (name, value) in &opts.attributes {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| RelayError::fatal_queue(format!("bad sqs attribute: {}", e)))?;
            request = request.message_attributes(name, attribute);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::transient_queue(format!("sqs send failed: {}", e)))?;
        let id = response.message_id().unwrap_or_default().to_string();
        debug!("Published {} to sqs queue {}", id, queue);
        Ok(id)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        batch_size: usize,
        wait_time_seconds: u64,
    ) -> Result<()> {
        let client = self.client()?;
        let queue_url = self.queue_url(queue).await?;
        info!("Consuming sqs queue {}", queue);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let received = tokio::select! {
                r = client
                    .receive_message()
                    .queue_url(&queue_url)
                    .max_number_of_messages(batch_size.clamp(1, 10) as i32)
                    .wait_time_seconds(wait_time_seconds.min(20) as i32)
                    .send() => match r {
                    Ok(output) => output,
                    Err(e) => {
                        error!("Error receiving from sqs queue {}: {}", queue, e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            for message in received.messages.unwrap_or_default() {
                let Some(receipt_handle) = message.receipt_handle().map(String::from) else {
                    continue;
                };
                let message_id = message.message_id().unwrap_or_default().to_string();
                let raw = message.body().unwrap_or_default();

                let body: Value = match serde_json::from_str(raw) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Undecodable message {}, dead-lettering: {}", message_id, e);
                        let dead = serde_json::json!({"raw": raw});
                        self.publish(&self.dlq_name.clone(), &dead, PublishOptions::default())
                            .await?;
                        client
                            .delete_message()
                            .queue_url(&queue_url)
                            .receipt_handle(&receipt_handle)
                            .send()
                            .await
                            .map_err(|e| {
                                RelayError::transient_queue(format!("sqs delete failed: {}", e))
                            })?;
                        continue;
                    }
                };

                self.unacked.lock().insert(
                    message_id.clone(),
                    Unacked {
                        queue_url: queue_url.clone(),
                        receipt_handle: receipt_handle.clone(),
                        body: body.clone(),
                    },
                );

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

    async fn acknowledge(&self, message_id: &str) -> Result<bool> {
        let Some(unacked) = self.unacked.lock().remove(message_id) else {
            return Ok(false);
        };
        let client = self.client()?;
        client
            .delete_message()
            .queue_url(&unacked.queue_url)
            .receipt_handle(&unacked.receipt_handle)
            .send()
            .await
            .map_err(|e| RelayError::transient_queue(format!("sqs delete failed: {}", e)))?;
        Ok(true)
    }

    async fn reject(&self, message_id: &str, requeue: bool, reason: Option<&str>) -> Result<bool> {
        let Some(unacked) = self.unacked.lock().remove(message_id) else {
            return Ok(false);
        };
        let client = self.client()?;

        if requeue {
            // Make the message visible again immediately.
            client
                .change_message_visibility()
                .queue_url(&unacked.queue_url)
                .receipt_handle(&unacked.receipt_handle)
                .visibility_timeout(0)
                .send()
                .await
                .map_err(|e| {
                    RelayError::transient_queue(format!("sqs visibility change failed: {}", e))
                })?;
            return Ok(true);
        }

        let mut dead = unacked.body;
        if let (Some(obj), Some(reason)) = (dead.as_object_mut(), reason) {
            obj.insert(
                "reject_reason".to_string(),
                Value::String(reason.to_string()),
            );
        }
        self.publish(&self.dlq_name.clone(), &dead, PublishOptions::default())
            .await?;
        client
            .delete_message()
            .queue_url(&unacked.queue_url)
            .receipt_handle(&unacked.receipt_handle)
            .send()
            .await
            .map_err(|e| RelayError::transient_queue(format!("sqs delete failed: {}", e)))?;
        Ok(true)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let client = self.client()?;
        let queue_url = self.queue_url(queue).await?;
        let attributes = client
            .get_queue_attributes()
            .queue_url(&queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| RelayError::transient_queue(format!("sqs attributes failed: {}", e)))?;

        Ok(attributes
            .attributes()
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn health_check(&self) -> bool {
        let Ok(client) = self.client() else {
            return false;
        };
        client.list_queues().max_results(1).send().await.is_ok()
    }
}
