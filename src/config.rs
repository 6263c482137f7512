//! Configuration management and validation.
//!
//! Settings are layered: built-in defaults, then an optional TOML/YAML file,
//! then environment variables with the `RELAYQ_` prefix and `__` separating
//! nesting levels (`RELAYQ_SERVER__PORT=9000`,
//! `RELAYQ_QUEUE__TYPE=kafka`, `RELAYQ_PROXY__ENDPOINTS__API__URL=...`).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::partition::PartitionSettings;

pub const ENV_PREFIX: &str = "RELAYQ";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub proxy: ProxySettings,
    pub cache: CacheSettings,
    pub routing: RoutingSettings,
    pub partitioning: PartitionSettings,
    pub monitoring: MonitoringSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            workers: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Memory,
    Redis,
    Kafka,
    Sqs,
    AzureEventhubs,
    GcpPubsub,
    Mqtt,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    #[serde(rename = "type")]
    pub queue_type: QueueType,

    // Redis Streams
    pub redis_url: String,
    pub redis_consumer_group: String,

    // Apache Kafka
    pub kafka_bootstrap_servers: String,
    pub kafka_consumer_group: String,

    // AWS SQS
    pub sqs_region: String,
    pub sqs_endpoint_url: Option<String>,

    // Azure Event Hubs
    pub azure_eventhubs_connection_string: String,
    pub azure_eventhubs_consumer_group: String,

    // GCP Pub/Sub
    pub gcp_project_id: String,

    // MQTT
    pub mqtt_broker_host: String,
    pub mqtt_broker_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_qos: u8,
    pub mqtt_client_id: String,

    // Compile-time registry key for `type = "custom"`
    pub custom_backend: String,

    // Common queue names
    pub request_queue_name: String,
    pub response_queue_name: String,
    pub dlq_name: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue_type: QueueType::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            redis_consumer_group: "relayq-workers".to_string(),
            kafka_bootstrap_servers: "localhost:9092".to_string(),
            kafka_consumer_group: "relayq-workers".to_string(),
            sqs_region: "us-east-1".to_string(),
            sqs_endpoint_url: None,
            azure_eventhubs_connection_string: String::new(),
            azure_eventhubs_consumer_group: "$Default".to_string(),
            gcp_project_id: String::new(),
            mqtt_broker_host: "localhost".to_string(),
            mqtt_broker_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_qos: 1,
            mqtt_client_id: String::new(),
            custom_backend: String::new(),
            request_queue_name: "relayq-requests".to_string(),
            response_queue_name: "relayq-responses".to_string(),
            dlq_name: "relayq-dlq".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Number of worker processes a deployment runs; used to derive default
    /// partition ownership.
    pub count: usize,
    /// Messages fetched per poll; handling stays serial per worker.
    pub batch_size: usize,
    /// Long-poll wait passed to the queue driver.
    pub wait_time_seconds: u64,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_base: f64,
    pub retry_delay_max: f64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 1,
            batch_size: 10,
            wait_time_seconds: 20,
            timeout_seconds: 300,
            max_retries: 3,
            retry_delay_base: 1.0,
            retry_delay_max: 60.0,
        }
    }
}

/// Authentication applied to outbound requests for one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Bearer { token: String },
    Basic { username: String, password: String },
    ApiKey { key: String, header: Option<String> },
    Custom { header: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: String,
    pub method: String,
    /// Request timeout in seconds.
    pub timeout: u64,
    pub headers: Option<HashMap<String, String>>,
    pub auth: Option<AuthConfig>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "POST".to_string(),
            timeout: 300,
            headers: None,
            auth: None,
        }
    }
}

impl EndpointConfig {
    pub fn from_url<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    /// Endpoint name or bare URL used when nothing else matches.
    pub default_endpoint: Option<String>,
    pub endpoints: HashMap<String, EndpointConfig>,
    /// Client headers forwarded upstream; `*` allows everything.
    pub forward_headers: Vec<String>,
    pub strip_headers: Vec<String>,
    /// Enables the built-in sample processor when no endpoint resolves.
    pub development_mode: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            default_endpoint: None,
            endpoints: HashMap::new(),
            forward_headers: vec![
                "Content-Type".to_string(),
                "Accept".to_string(),
                "User-Agent".to_string(),
            ],
            strip_headers: vec!["Host".to_string(), "Connection".to_string()],
            development_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    pub redis_url: String,
    pub ttl_seconds: u64,
    /// Pool sizing for backends that pool; the redis connection manager
    /// multiplexes a single connection and ignores it.
    pub max_connections: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            ttl_seconds: 3600,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub enabled: bool,
    /// Path to a YAML or JSON routing configuration file.
    pub config_path: Option<String>,
    /// Inline routing configuration as a JSON string.
    pub config_dict: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub metrics_enabled: bool,
    pub log_level: String,
    pub log_format: String,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("proxy.forward_headers")
                .with_list_parse_key("proxy.strip_headers"),
        );

        let settings: Settings = builder
            .build()
            .map_err(|e| RelayError::config(format!("failed to load configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| RelayError::config(format!("failed to parse configuration: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the environment only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.batch_size == 0 {
            return Err(RelayError::config("worker.batch_size must be at least 1"));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(RelayError::config("cache.ttl_seconds must be greater than 0"));
        }
        if self.partitioning.partition_count == 0 {
            return Err(RelayError::config(
                "partitioning.partition_count must be at least 1",
            ));
        }
        for (name, endpoint) in &self.proxy.endpoints {
            if endpoint.url.is_empty() {
                return Err(RelayError::config(format!(
                    "endpoint '{}' has an empty url",
                    name
                )));
            }
        }
        if self.queue.queue_type == QueueType::Custom && self.queue.custom_backend.is_empty() {
            return Err(RelayError::config(
                "queue.type is 'custom' but queue.custom_backend is not set",
            ));
        }
        self.check_driver_available()?;
        Ok(())
    }

    /// Reject queue types whose driver was not compiled into this build.
    fn check_driver_available(&self) -> Result<()> {
        let missing = match self.queue.queue_type {
            QueueType::Sqs if !cfg!(feature = "sqs") => Some("sqs"),
            QueueType::GcpPubsub if !cfg!(feature = "gcp-pubsub") => Some("gcp-pubsub"),
            QueueType::AzureEventhubs if !cfg!(feature = "azure-eventhubs") => {
                Some("azure-eventhubs")
            }
            QueueType::Mqtt if !cfg!(feature = "mqtt") => Some("mqtt"),
            _ => None,
        };
        if let Some(feature) = missing {
            return Err(RelayError::config(format!(
                "queue driver not compiled into this build; rebuild with --features {}",
                feature
            )));
        }
        Ok(())
    }

    /// TTL applied to request state and response records.
    ///
    /// Never shorter than the worker timeout plus a buffer, so an in-flight
    /// request cannot outlive its own state record.
    pub fn request_ttl(&self) -> u64 {
        self.cache.ttl_seconds.max(self.worker.timeout_seconds + 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.queue.request_queue_name, "relayq-requests");
        assert_eq!(settings.worker.max_retries, 3);
        assert!(!settings.proxy.enabled);
    }

    #[test]
    fn request_ttl_covers_worker_timeout() {
        let mut settings = Settings::default();
        assert_eq!(settings.request_ttl(), 3600);

        settings.worker.timeout_seconds = 7200;
        assert_eq!(settings.request_ttl(), 7260);
    }

    #[test]
    fn custom_queue_requires_backend_name() {
        let mut settings = Settings::default();
        settings.queue.queue_type = QueueType::Custom;
        assert!(settings.validate().is_err());

        settings.queue.custom_backend = "memory".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn empty_endpoint_url_rejected() {
        let mut settings = Settings::default();
        settings
            .proxy
            .endpoints
            .insert("bad".to_string(), EndpointConfig::default());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[queue]
type = "memory"
request_queue_name = "test-requests"

[worker]
max_retries = 5

[proxy]
enabled = true

[proxy.endpoints.echo]
url = "http://localhost:9999/echo"

[proxy.endpoints.echo.auth]
type = "bearer"
token = "secret"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.queue.queue_type, QueueType::Memory);
        assert_eq!(settings.queue.request_queue_name, "test-requests");
        assert_eq!(settings.worker.max_retries, 5);
        assert!(settings.proxy.enabled);
        let echo = settings.proxy.endpoints.get("echo").unwrap();
        assert_eq!(echo.url, "http://localhost:9999/echo");
        assert!(matches!(echo.auth, Some(AuthConfig::Bearer { .. })));
    }

    #[test]
    fn env_overrides_apply() {
        // Keys chosen to not collide with the file-loading test, which may
        // run concurrently and also reads the environment.
        std::env::set_var("RELAYQ_CACHE__TTL_SECONDS", "7200");
        std::env::set_var("RELAYQ_QUEUE__DLQ_NAME", "env-dlq");
        std::env::set_var("RELAYQ_PARTITIONING__PARTITION_COUNT", "32");

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.cache.ttl_seconds, 7200);
        assert_eq!(settings.queue.dlq_name, "env-dlq");
        assert_eq!(settings.partitioning.partition_count, 32);

        std::env::remove_var("RELAYQ_CACHE__TTL_SECONDS");
        std::env::remove_var("RELAYQ_QUEUE__DLQ_NAME");
        std::env::remove_var("RELAYQ_PARTITIONING__PARTITION_COUNT");
    }
}
