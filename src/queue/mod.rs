//! Queue abstraction over pluggable message brokers.
//!
//! Every driver implements [`QueueBackend`] with the same at-least-once
//! contract: `consume` delivers messages to the handler one at a time,
//! acknowledges on handler success, and on handler failure requeues
//! (transient errors) or forwards to the dead-letter queue (everything
//! else). Batch size is a fetch optimisation only.
//!
//! Built-in drivers: `memory`, `redis` (Streams), `kafka`. The `sqs`,
//! `gcp-pubsub`, `azure-eventhubs`, and `mqtt` drivers are enabled by the
//! Cargo feature of the same name. `type = "custom"` resolves through the
//! compile-time registry; no dynamic loading.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::info;

use crate::config::{QueueSettings, QueueType};
use crate::error::{RelayError, Result};

pub mod kafka;
pub mod memory;
pub mod redis;

#[cfg(feature = "azure-eventhubs")]
pub mod eventhubs;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "gcp-pubsub")]
pub mod pubsub;
#[cfg(feature = "sqs")]
pub mod sqs;

/// A message delivered to a consume handler.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Backend-assigned identifier, usable with `acknowledge`/`reject`.
    pub id: String,
    pub body: Value,
    pub attributes: HashMap<String, String>,
    /// Delivery count observed by the driver, when the backend exposes it.
    pub delivery_count: u32,
}

impl QueueMessage {
    pub fn new(id: String, body: Value) -> Self {
        Self {
            id,
            body,
            attributes: HashMap::new(),
            delivery_count: 0,
        }
    }
}

/// Options applied to a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Priority 0-9; drivers without priority support ignore it.
    pub priority: u8,
    pub attributes: HashMap<String, String>,
    /// Delay before the message becomes visible. Drivers without native
    /// delayed delivery schedule the publish in-process (documented per
    /// driver).
    pub delay_seconds: u64,
}

impl PublishOptions {
    pub fn with_delay(delay_seconds: u64) -> Self {
        Self {
            delay_seconds,
            ..Default::default()
        }
    }
}

/// Handler invoked once per consumed message.
pub type MessageHandler = Arc<dyn Fn(QueueMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Establish the broker connection. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Stop consumers and close the connection. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Publish a message, returning the backend-assigned message id.
    async fn publish(&self, queue: &str, message: &Value, opts: PublishOptions) -> Result<String>;

    /// Long-running consume loop. Returns after `disconnect` is called.
    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        batch_size: usize,
        wait_time_seconds: u64,
    ) -> Result<()>;

    /// Acknowledge a message outside the consume loop. The default consume
    /// loop acknowledges automatically on handler success.
    async fn acknowledge(&self, message_id: &str) -> Result<bool>;

    /// Reject a message; without requeue it is forwarded to the DLQ.
    async fn reject(&self, message_id: &str, requeue: bool, reason: Option<&str>) -> Result<bool>;

    /// Approximate queue depth; 0 for drivers that cannot report it.
    async fn queue_depth(&self, queue: &str) -> Result<u64>;

    /// Whether the broker is reachable.
    async fn health_check(&self) -> bool;
}

/// Constructor signature for registered custom backends.
pub type BackendFactory = fn(&QueueSettings) -> Result<Arc<dyn QueueBackend>>;

static CUSTOM_REGISTRY: Lazy<parking_lot::RwLock<HashMap<String, BackendFactory>>> =
    Lazy::new(|| {
        let mut registry: HashMap<String, BackendFactory> = HashMap::new();
        // The in-memory broker doubles as the reference registration.
        registry.insert("memory".to_string(), |settings| {
            Ok(Arc::new(memory::MemoryQueue::new(settings)) as Arc<dyn QueueBackend>)
        });
        parking_lot::RwLock::new(registry)
    });

/// Register a backend under a name resolvable via `queue.type = "custom"`
/// and `queue.custom_backend = "<name>"`.
pub fn register_backend(name: &str, factory: BackendFactory) {
    CUSTOM_REGISTRY
        .write()
        .insert(name.to_lowercase(), factory);
    info!("Registered custom queue backend '{}'", name);
}

/// Names available through the custom registry.
pub fn registered_backends() -> Vec<String> {
    let mut names: Vec<String> = CUSTOM_REGISTRY.read().keys().cloned().collect();
    names.sort();
    names
}

/// Create the configured queue backend. Does not connect.
pub fn create_queue(settings: &QueueSettings) -> Result<Arc<dyn QueueBackend>> {
    match settings.queue_type {
        QueueType::Memory => Ok(Arc::new(memory::MemoryQueue::new(settings))),
        QueueType::Redis => Ok(Arc::new(redis::RedisQueue::new(settings))),
        QueueType::Kafka => Ok(Arc::new(kafka::KafkaQueue::new(settings))),

        #[cfg(feature = "sqs")]
        QueueType::Sqs => Ok(Arc::new(sqs::SqsQueue::new(settings))),
        #[cfg(not(feature = "sqs"))]
        QueueType::Sqs => Err(unavailable("sqs")),

        #[cfg(feature = "gcp-pubsub")]
        QueueType::GcpPubsub => Ok(Arc::new(pubsub::PubSubQueue::new(settings))),
        #[cfg(not(feature = "gcp-pubsub"))]
        QueueType::GcpPubsub => Err(unavailable("gcp-pubsub")),

        #[cfg(feature = "azure-eventhubs")]
        QueueType::AzureEventhubs => Ok(Arc::new(eventhubs::EventHubsQueue::new(settings))),
        #[cfg(not(feature = "azure-eventhubs"))]
        QueueType::AzureEventhubs => Err(unavailable("azure-eventhubs")),

        #[cfg(feature = "mqtt")]
        QueueType::Mqtt => Ok(Arc::new(mqtt::MqttQueue::new(settings))),
        #[cfg(not(feature = "mqtt"))]
        QueueType::Mqtt => Err(unavailable("mqtt")),

        QueueType::Custom => {
            let name = settings.custom_backend.to_lowercase();
            let registry = CUSTOM_REGISTRY.read();
            let factory = registry.get(&name).ok_or_else(|| {
                RelayError::fatal_queue(format!(
                    "unknown custom queue backend '{}'; registered: {}",
                    name,
                    registered_backends().join(", ")
                ))
            })?;
            factory(settings)
        }
    }
}

#[allow(dead_code)]
fn unavailable(feature: &str) -> RelayError {
    RelayError::fatal_queue(format!(
        "queue driver not compiled into this build; rebuild with --features {}",
        feature
    ))
}
