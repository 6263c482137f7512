//! In-process queue backend.
//!
//! Backs the test suite and single-node development setups, and serves as
//! the reference implementation for the custom-backend registry. Supports
//! delayed delivery, ack/nack, depth reporting, and DLQ forwarding.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueSettings;
use crate::error::Result;
use crate::queue::{MessageHandler, PublishOptions, QueueBackend, QueueMessage};

struct Pending {
    id: String,
    body: Value,
    attributes: HashMap<String, String>,
    available_at: Instant,
    delivery_count: u32,
}

struct Unacked {
    queue: String,
    body: Value,
    attributes: HashMap<String, String>,
    delivery_count: u32,
}

struct Inner {
    queues: parking_lot::Mutex<HashMap<String, VecDeque<Pending>>>,
    unacked: parking_lot::Mutex<HashMap<String, Unacked>>,
    publish_counts: parking_lot::Mutex<HashMap<String, u64>>,
    notify: tokio::sync::Notify,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

pub struct MemoryQueue {
    dlq_name: String,
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            dlq_name: settings.dlq_name.clone(),
            inner: Arc::new(Inner {
                queues: parking_lot::Mutex::new(HashMap::new()),
                unacked: parking_lot::Mutex::new(HashMap::new()),
                publish_counts: parking_lot::Mutex::new(HashMap::new()),
                notify: tokio::sync::Notify::new(),
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn enqueue(
        &self,
        queue: &str,
        body: Value,
        attributes: HashMap<String, String>,
        delay: Duration,
        delivery_count: u32,
    ) -> String {
        let id = format!("mem-{}", self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(Pending {
                id: id.clone(),
                body,
                attributes,
                available_at: Instant::now() + delay,
                delivery_count,
            });
        *self
            .inner
            .publish_counts
            .lock()
            .entry(queue.to_string())
            .or_default() += 1;
        self.inner.notify.notify_waiters();
        id
    }

    fn pop_ready(&self, queue: &str, max: usize) -> Vec<Pending> {
        let mut queues = self.inner.queues.lock();
        let Some(pending) = queues.get_mut(queue) else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut remaining = VecDeque::with_capacity(pending.len());
        while let Some(msg) = pending.pop_front() {
            if ready.len() < max && msg.available_at <= now {
                ready.push(msg);
            } else {
                remaining.push_back(msg);
            }
        }
        *pending = remaining;
        ready
    }

    /// Total messages ever published to a queue. Test observability hook.
    pub fn published_total(&self, queue: &str) -> u64 {
        self.inner
            .publish_counts
            .lock()
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    /// Pop a single ready message without the consume loop. Used by tests
    /// to inspect DLQ and response-queue contents.
    pub fn try_pop(&self, queue: &str) -> Option<QueueMessage> {
        self.pop_ready(queue, 1).into_iter().next().map(|p| {
            let mut msg = QueueMessage::new(p.id, p.body);
            msg.attributes = p.attributes;
            msg.delivery_count = p.delivery_count;
            msg
        })
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &Value, opts: PublishOptions) -> Result<String> {
        let id = self.enqueue(
            queue,
            message.clone(),
            opts.attributes,
            Duration::from_secs(opts.delay_seconds),
            0,
        );
        debug!("Published {} to in-memory queue {}", id, queue);
        Ok(id)
    }

    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        batch_size: usize,
        _wait_time_seconds: u64,
    ) -> Result<()> {
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Ok(());
            }

            let batch = self.pop_ready(queue, batch_size.max(1));
            if batch.is_empty() {
                tokio::select! {
                    _ = self.inner.notify.notified() => {}
                    // Delayed messages become ready without a notify.
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = self.inner.shutdown.cancelled() => return Ok(()),
                }
                continue;
            }

            for pending in batch {
                let id = pending.id.clone();
                self.inner.unacked.lock().insert(
                    id.clone(),
                    Unacked {
                        queue: queue.to_string(),
                        body: pending.body.clone(),
                        attributes: pending.attributes.clone(),
                        delivery_count: pending.delivery_count,
                    },
                );

                let mut msg = QueueMessage::new(id.clone(), pending.body);
                msg.attributes = pending.attributes;
                msg.delivery_count = pending.delivery_count;

                match handler(msg).await {
                    Ok(()) => {
                        self.acknowledge(&id).await?;
                    }
                    Err(e) if e.is_transient() => {
                        warn!("Handler failed transiently, requeueing {}: {}", id, e);
                        self.reject(&id, true, Some(&e.to_string())).await?;
                    }
                    Err(e) => {
                        warn!("Handler failed, dead-lettering {}: {}", id, e);
                        self.reject(&id, false, Some(&e.to_string())).await?;
                    }
                }
            }
        }
    }

    async fn acknowledge(&self, message_id: &str) -> Result<bool> {
        Ok(self.inner.unacked.lock().remove(message_id).is_some())
    }

    async fn reject(&self, message_id: &str, requeue: bool, reason: Option<&str>) -> Result<bool> {
        let Some(unacked) = self.inner.unacked.lock().remove(message_id) else {
            return Ok(false);
        };
        if requeue {
            self.enqueue(
                &unacked.queue,
                unacked.body,
                unacked.attributes,
                Duration::ZERO,
                unacked.delivery_count + 1,
            );
        } else {
            let mut attributes = unacked.attributes;
            if let Some(reason) = reason {
                attributes.insert("reject_reason".to_string(), reason.to_string());
            }
            self.enqueue(&self.dlq_name, unacked.body, attributes, Duration::ZERO, 0);
        }
        Ok(true)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        Ok(self
            .inner
            .queues
            .lock()
            .get(queue)
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }

    async fn health_check(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn queue() -> MemoryQueue {
        MemoryQueue::new(&QueueSettings::default())
    }

    #[tokio::test]
    async fn publish_and_depth() {
        let q = queue();
        q.publish("jobs", &json!({"n": 1}), PublishOptions::default())
            .await
            .unwrap();
        q.publish("jobs", &json!({"n": 2}), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(q.queue_depth("jobs").await.unwrap(), 2);
        assert_eq!(q.queue_depth("other").await.unwrap(), 0);
        assert_eq!(q.published_total("jobs"), 2);
    }

    #[tokio::test]
    async fn delayed_messages_not_immediately_visible() {
        let q = queue();
        q.publish("jobs", &json!({"n": 1}), PublishOptions::with_delay(30))
            .await
            .unwrap();
        assert!(q.try_pop("jobs").is_none());
        assert_eq!(q.queue_depth("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn consume_acks_on_success() {
        let q = Arc::new(queue());
        q.publish("jobs", &json!({"n": 1}), PublishOptions::default())
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let handler: MessageHandler = Arc::new(move |msg| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                assert_eq!(msg.body["n"], 1);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let consumer = q.clone();
        let task = tokio::spawn(async move { consumer.consume("jobs", handler, 5, 1).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        q.disconnect().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(q.queue_depth("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fatal_handler_error_routes_to_dlq() {
        let q = Arc::new(queue());
        q.publish("jobs", &json!({"n": 1}), PublishOptions::default())
            .await
            .unwrap();

        let handler: MessageHandler = Arc::new(|_| {
            Box::pin(async { Err(crate::error::RelayError::fatal("boom")) })
        });

        let consumer = q.clone();
        let task = tokio::spawn(async move { consumer.consume("jobs", handler, 1, 1).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        q.disconnect().await.unwrap();
        task.await.unwrap().unwrap();

        let dlq_msg = q.try_pop("relayq-dlq").expect("message in DLQ");
        assert_eq!(dlq_msg.body["n"], 1);
        assert!(dlq_msg.attributes.contains_key("reject_reason"));
    }

    #[tokio::test]
    async fn explicit_reject_requeues() {
        let q = queue();
        q.publish("jobs", &json!({"n": 7}), PublishOptions::default())
            .await
            .unwrap();

        let msg = q.try_pop("jobs").unwrap();
        // try_pop does not track unacked state, emulate the consume loop.
        q.inner.unacked.lock().insert(
            msg.id.clone(),
            Unacked {
                queue: "jobs".to_string(),
                body: msg.body.clone(),
                attributes: HashMap::new(),
                delivery_count: 0,
            },
        );

        assert!(q.reject(&msg.id, true, None).await.unwrap());
        let redelivered = q.try_pop("jobs").unwrap();
        assert_eq!(redelivered.body["n"], 7);
        assert_eq!(redelivered.delivery_count, 1);
    }
}
