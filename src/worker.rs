//! Worker: consume the request queue, drive each message through the
//! processor, and record the outcome.
//!
//! Per-message state machine: PENDING → PROCESSING → (COMPLETED | FAILED).
//! Transient failures republish the original message with an incremented
//! retry count and exponential backoff; exhausted retries and fatal
//! failures go to the DLQ. Handling is serial within one worker; scale by
//! running more worker processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::models::{
    meta_key, resp_key, RequestEnvelope, RequestState, RequestStatus, ResponseRecord,
};
use crate::processor::Processor;
use crate::queue::{MessageHandler, PublishOptions, QueueBackend, QueueMessage};
use crate::store::StateStore;
use crate::util::shutdown_signal;

/// How long shutdown waits for the in-flight message.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Worker {
    worker_id: String,
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn StateStore>,
    processor: Arc<Processor>,
    settings: Arc<Settings>,
    current: tokio::sync::Mutex<Option<Uuid>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        worker_id: String,
        queue: Arc<dyn QueueBackend>,
        store: Arc<dyn StateStore>,
        processor: Arc<Processor>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            worker_id,
            queue,
            store,
            processor,
            settings,
            current: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the consume loop until a termination signal or `shutdown`.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!("Worker {} started", self.worker_id);
        metrics::WORKER_ACTIVE
            .with_label_values(&[&self.worker_id])
            .set(1);

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            token.cancel();
        });

        let sweeper = self.clone();
        let sweep_token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => sweeper.processor.cleanup_sessions(),
                    _ = sweep_token.cancelled() => break,
                }
            }
        });

        // Cancellation stops the consume loop through the driver, which
        // lets the in-flight message finish instead of dropping it.
        let queue = self.queue.clone();
        let stop_token = self.shutdown.clone();
        tokio::spawn(async move {
            stop_token.cancelled().await;
            if let Err(e) = queue.disconnect().await {
                warn!("Queue disconnect on shutdown failed: {}", e);
            }
        });

        let worker = self.clone();
        let handler: MessageHandler = Arc::new(move |message| {
            let worker = worker.clone();
            Box::pin(async move { worker.handle_message(message).await })
        });

        let result = self
            .queue
            .consume(
                &self.settings.queue.request_queue_name,
                handler,
                self.settings.worker.batch_size,
                self.settings.worker.wait_time_seconds,
            )
            .await;

        if let Err(e) = &result {
            error!("Worker {} consume loop failed: {}", self.worker_id, e);
        }
        self.shutdown().await?;
        result
    }

    async fn handle_message(&self, message: QueueMessage) -> Result<()> {
        let envelope = RequestEnvelope::from_value(&message.body)
            .map_err(|e| RelayError::fatal(format!("malformed request message: {}", e)))?;
        let correlation_id = envelope.correlation_id;

        *self.current.lock().await = Some(correlation_id);
        info!(
            "Worker {} processing {}",
            self.worker_id, correlation_id
        );
        let outcome = self.process_envelope(&envelope).await;
        *self.current.lock().await = None;
        outcome
    }

    async fn process_envelope(&self, envelope: &RequestEnvelope) -> Result<()> {
        let correlation_id = envelope.correlation_id;
        let ttl = self.settings.request_ttl();

        let processing = RequestState {
            status: RequestStatus::Processing,
            submitted_at: envelope.timestamp,
            updated_at: chrono::Utc::now(),
        };
        self.write_state(&correlation_id, &processing, ttl).await?;

        let full_message = envelope.to_value()?;
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            Duration::from_secs(self.settings.worker.timeout_seconds),
            self.processor.process(
                &envelope.payload,
                &envelope.metadata,
                envelope.headers.as_ref(),
                &full_message,
            ),
        )
        .await
        .unwrap_or_else(|_| Err(RelayError::transient("processing timed out")));

        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((result, status_code, response_headers)) => {
                self.record_success(
                    envelope,
                    result,
                    status_code,
                    response_headers,
                    elapsed_ms,
                    ttl,
                )
                .await
            }
            Err(RelayError::PartitionSkip(_)) => {
                // Requeue policy: hand the unchanged message back for
                // another worker; no retry counting, no state change.
                info!(
                    "Requeueing {}: partition not assigned to worker {}",
                    correlation_id, self.worker_id
                );
                self.queue
                    .publish(
                        &self.settings.queue.request_queue_name,
                        &full_message,
                        PublishOptions::default(),
                    )
                    .await?;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.handle_transient(envelope, &full_message, e, ttl).await
            }
            Err(e) => {
                error!(
                    "Fatal error processing {}: {}",
                    correlation_id, e
                );
                metrics::WORKER_ERRORS_TOTAL
                    .with_label_values(&["fatal"])
                    .inc();
                metrics::WORKER_PROCESSING_SECONDS
                    .with_label_values(&["failure"])
                    .observe(elapsed_ms as f64 / 1000.0);
                self.send_to_dlq(&full_message, &e.to_string()).await;
                self.mark_failed(envelope, &e.to_string(), ttl).await;
                Ok(())
            }
        }
    }

    async fn record_success(
        &self,
        envelope: &RequestEnvelope,
        result: Value,
        status_code: u16,
        response_headers: HashMap<String, String>,
        elapsed_ms: u64,
        ttl: u64,
    ) -> Result<()> {
        let correlation_id = envelope.correlation_id;

        let completed = RequestState {
            status: RequestStatus::Completed,
            submitted_at: envelope.timestamp,
            updated_at: chrono::Utc::now(),
        };
        self.write_state(&correlation_id, &completed, ttl).await?;

        let record = ResponseRecord::success(
            result.clone(),
            status_code,
            response_headers.clone(),
            elapsed_ms,
        );
        self.store
            .set(
                &resp_key(&correlation_id),
                &serde_json::to_value(&record)?,
                Some(ttl),
            )
            .await
            .map_err(|e| RelayError::transient(format!("response record write failed: {}", e)))?;

        // Mirror the result for fan-out consumers. Not load-bearing for the
        // query API, so a failure only logs.
        let mirror = json!({
            "correlation_id": correlation_id,
            "result": result,
            "status_code": status_code,
            "headers": response_headers,
            "status": RequestStatus::Completed,
            "timestamp": chrono::Utc::now(),
            "processing_time_ms": elapsed_ms,
        });
        if let Err(e) = self
            .queue
            .publish(
                &self.settings.queue.response_queue_name,
                &mirror,
                PublishOptions::default(),
            )
            .await
        {
            warn!("Failed to mirror response for {}: {}", correlation_id, e);
        }

        info!(
            "Worker {} completed {} in {} ms",
            self.worker_id, correlation_id, elapsed_ms
        );
        metrics::WORKER_PROCESSING_SECONDS
            .with_label_values(&["success"])
            .observe(elapsed_ms as f64 / 1000.0);
        Ok(())
    }

    async fn handle_transient(
        &self,
        envelope: &RequestEnvelope,
        full_message: &Value,
        error: RelayError,
        ttl: u64,
    ) -> Result<()> {
        let correlation_id = envelope.correlation_id;
        let retry_count = envelope.metadata.retry_count;
        metrics::WORKER_ERRORS_TOTAL
            .with_label_values(&["transient"])
            .inc();

        if retry_count < self.settings.worker.max_retries {
            let delay = self.retry_delay(retry_count);
            let mut retried = envelope.clone();
            retried.metadata.retry_count = retry_count + 1;

            warn!(
                "Transient error on {} (attempt {}), retrying in {} s: {}",
                correlation_id,
                retry_count + 1,
                delay,
                error
            );
            self.queue
                .publish(
                    &self.settings.queue.request_queue_name,
                    &retried.to_value()?,
                    PublishOptions::with_delay(delay),
                )
                .await?;
            return Ok(());
        }

        error!(
            "Retries exhausted for {} after {} attempts: {}",
            correlation_id,
            retry_count + 1,
            error
        );
        self.send_to_dlq(full_message, &error.to_string()).await;
        self.mark_failed(envelope, &error.to_string(), ttl).await;
        Ok(())
    }

    /// Exponential backoff in whole seconds, capped by the configured max.
    fn retry_delay(&self, retry_count: u32) -> u64 {
        let base = self.settings.worker.retry_delay_base;
        let max = self.settings.worker.retry_delay_max;
        let delay = base * 2f64.powi(retry_count.min(30) as i32);
        delay.min(max).round() as u64
    }

    async fn write_state(
        &self,
        correlation_id: &Uuid,
        state: &RequestState,
        ttl: u64,
    ) -> Result<()> {
        self.store
            .set(
                &meta_key(correlation_id),
                &serde_json::to_value(state)?,
                Some(ttl),
            )
            .await
            .map_err(|e| RelayError::transient(format!("state write failed: {}", e)))
    }

    /// DLQ message: the original message plus failure context.
    async fn send_to_dlq(&self, full_message: &Value, error: &str) {
        let mut dead = full_message.clone();
        if let Some(obj) = dead.as_object_mut() {
            obj.insert(
                "failed_at".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
            obj.insert("worker_id".to_string(), json!(self.worker_id));
            obj.insert("error".to_string(), json!(error));
        }

        match self
            .queue
            .publish(
                &self.settings.queue.dlq_name,
                &dead,
                PublishOptions::default(),
            )
            .await
        {
            Ok(_) => {
                metrics::QUEUE_DLQ_TOTAL
                    .with_label_values(&["processing_failed"])
                    .inc();
            }
            Err(e) => error!("Failed to publish to DLQ: {}", e),
        }
    }

    async fn mark_failed(&self, envelope: &RequestEnvelope, error: &str, ttl: u64) {
        let correlation_id = envelope.correlation_id;

        let failed = RequestState {
            status: RequestStatus::Failed,
            submitted_at: envelope.timestamp,
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = self.write_state(&correlation_id, &failed, ttl).await {
            error!("Failed to mark {} as failed: {}", correlation_id, e);
        }

        let record = ResponseRecord::failure(error.to_string());
        let record_value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to serialize failure record: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&resp_key(&correlation_id), &record_value, Some(ttl))
            .await
        {
            error!(
                "Failed to store failure record for {}: {}",
                correlation_id, e
            );
        }
    }

    /// Stop consuming, wait for the in-flight message, then disconnect.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down worker {}", self.worker_id);
        self.shutdown.cancel();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            if self.current.lock().await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        metrics::WORKER_ACTIVE
            .with_label_values(&[&self.worker_id])
            .set(0);
        self.queue.disconnect().await?;
        self.store.close().await?;
        info!("Worker {} shutdown complete", self.worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Processor;
    use crate::queue::memory::MemoryQueue;
    use crate::store::MemoryStore;

    fn worker_with_settings(settings: Settings) -> Worker {
        let settings = Arc::new(settings);
        let queue = Arc::new(MemoryQueue::new(&settings.queue));
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(Processor::new(settings.clone(), "worker-0").unwrap());
        Worker::new(
            "worker-0".to_string(),
            queue,
            store,
            processor,
            settings,
        )
    }

    #[test]
    fn retry_delay_is_capped_exponential() {
        let mut settings = Settings::default();
        settings.worker.retry_delay_base = 1.0;
        settings.worker.retry_delay_max = 60.0;
        let worker = worker_with_settings(settings);

        assert_eq!(worker.retry_delay(0), 1);
        assert_eq!(worker.retry_delay(1), 2);
        assert_eq!(worker.retry_delay(2), 4);
        assert_eq!(worker.retry_delay(10), 60);
        // Large counts must not overflow.
        assert_eq!(worker.retry_delay(u32::MAX), 60);
    }
}
