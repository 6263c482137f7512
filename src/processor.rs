//! Message processor: apply partitioning and routing, then forward the
//! payload to the resolved upstream endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, EndpointConfig, ProxySettings, RoutingSettings, Settings};
use crate::error::{RelayError, Result};
use crate::models::RequestMetadata;
use crate::partition::{PartitionManager, SkipPolicy};
use crate::routing::RoutingEngine;
use crate::util::scalar_string;

/// Response headers never forwarded back to callers.
const HOP_BY_HOP: [&str; 2] = ["transfer-encoding", "connection"];

pub struct Processor {
    settings: Arc<Settings>,
    routing: Option<RoutingEngine>,
    partitions: Option<PartitionManager>,
    client: OnceCell<reqwest::Client>,
}

impl Processor {
    pub fn new(settings: Arc<Settings>, worker_id: &str) -> Result<Self> {
        let routing = init_routing(&settings.routing)?;
        let partitions = settings
            .partitioning
            .enabled
            .then(|| PartitionManager::new(settings.partitioning.clone(), worker_id.to_string()));
        if partitions.is_some() {
            info!("Partition manager enabled for worker {}", worker_id);
        }
        Ok(Self {
            settings,
            routing,
            partitions,
            client: OnceCell::new(),
        })
    }

    /// Shared outbound HTTP client, lazily created, safe for concurrent use.
    fn http_client(&self) -> Result<&reqwest::Client> {
        self.client.get_or_try_init(|| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(self.settings.worker.timeout_seconds))
                .build()
                .map_err(RelayError::from)
        })
    }

    /// Process one message: returns `(body, status_code, response_headers)`.
    pub async fn process(
        &self,
        payload: &Value,
        metadata: &RequestMetadata,
        headers: Option<&HashMap<String, String>>,
        full_message: &Value,
    ) -> Result<(Value, u16, HashMap<String, String>)> {
        if let Some(partitions) = &self.partitions {
            if !partitions.should_process(full_message) {
                let correlation_id = full_message
                    .get("correlation_id")
                    .map(scalar_string)
                    .unwrap_or_default();
                match partitions.skip_policy() {
                    SkipPolicy::Ack => {
                        info!(
                            "Skipping {}: partition not assigned to this worker",
                            correlation_id
                        );
                        return Ok((
                            json!({"skipped": true, "reason": "partition_not_assigned"}),
                            200,
                            HashMap::new(),
                        ));
                    }
                    SkipPolicy::Requeue => {
                        return Err(RelayError::PartitionSkip(correlation_id));
                    }
                }
            }
        }

        let mut endpoint_name = metadata.endpoint.clone();
        let mut method = metadata.method.clone();
        let mut out_payload = payload.clone();
        let mut routing_headers = HashMap::new();
        let mut query_params = HashMap::new();
        let mut timeout = metadata.timeout;

        if let Some(engine) = &self.routing {
            let routed = engine.route(full_message)?;
            debug!(
                "Message routed via {} to {}",
                routed.route_name.as_deref().unwrap_or("<fallback>"),
                routed.endpoint
            );
            endpoint_name = Some(routed.endpoint);
            method = Some(routed.method);
            out_payload = routed.payload;
            routing_headers = routed.headers;
            query_params = routed.query_params;
            if let Some(t) = routed.timeout {
                timeout = t;
            }
        }

        let Some(endpoint) = self.resolve_endpoint(endpoint_name.as_deref())? else {
            if self.settings.proxy.development_mode {
                return sample_process(&out_payload);
            }
            return Err(RelayError::fatal(
                "no endpoint specified and no default endpoint configured",
            ));
        };

        let http_method = method
            .as_deref()
            .unwrap_or(&endpoint.method)
            .to_uppercase();
        let http_method = reqwest::Method::from_bytes(http_method.as_bytes())
            .map_err(|_| RelayError::fatal(format!("invalid HTTP method '{}'", http_method)))?;

        let mut out_headers =
            merge_headers(&endpoint, headers, &self.settings.proxy);
        out_headers.extend(routing_headers);

        let client = self.http_client()?;
        let mut request = client
            .request(http_method, &endpoint.url)
            .json(&out_payload)
            .timeout(Duration::from_secs(timeout.max(1)));
        if !query_params.is_empty() {
            let pairs: Vec<(&String, &String)> = query_params.iter().collect();
            request = request.query(&pairs);
        }
        for (name, value) in &out_headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::transient(format!("request to {} timed out", endpoint.url))
            } else {
                RelayError::transient(format!("request to {} failed: {}", endpoint.url, e))
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RelayError::transient(format!(
                "upstream {} returned {}",
                endpoint.url, status
            )));
        }

        let mut response_headers = HashMap::new();
        for (name, value) in response.headers() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            response_headers.insert(
                name.to_string(),
                value.to_str().unwrap_or_default().to_string(),
            );
        }

        let content_type = response_headers
            .get("content-type")
            .cloned()
            .unwrap_or_default();
        let body = if content_type.contains("application/json") {
            response
                .json::<Value>()
                .await
                .map_err(|e| RelayError::transient(format!("invalid JSON from upstream: {}", e)))?
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| RelayError::transient(format!("failed to read upstream body: {}", e)))?;
            json!({"response": text, "content_type": content_type})
        };

        if let Some(partitions) = &self.partitions {
            partitions.track_session(full_message);
        }

        Ok((body, status.as_u16(), response_headers))
    }

    /// Resolve an endpoint name (or bare URL) into a configuration.
    /// `Ok(None)` means proxying is off or nothing is configured, and the
    /// development fallback may apply.
    fn resolve_endpoint(&self, name: Option<&str>) -> Result<Option<EndpointConfig>> {
        if !self.settings.proxy.enabled {
            return Ok(None);
        }
        if let Some(name) = name {
            if let Some(endpoint) = self.settings.proxy.endpoints.get(name) {
                return Ok(Some(endpoint.clone()));
            }
            if name.starts_with("http://") || name.starts_with("https://") {
                return Ok(Some(EndpointConfig::from_url(name)));
            }
            return Err(RelayError::fatal(format!("unknown endpoint '{}'", name)));
        }

        if let Some(default) = &self.settings.proxy.default_endpoint {
            if let Some(endpoint) = self.settings.proxy.endpoints.get(default) {
                return Ok(Some(endpoint.clone()));
            }
            if default.starts_with("http://") || default.starts_with("https://") {
                return Ok(Some(EndpointConfig::from_url(default)));
            }
            return Err(RelayError::fatal(format!(
                "unknown default endpoint '{}'",
                default
            )));
        }

        Ok(None)
    }

    /// Derive partition ownership from the worker's index.
    pub fn set_partition_assignments(&self, worker_count: usize, worker_index: usize) {
        if let Some(partitions) = &self.partitions {
            partitions.assign_worker_partitions(worker_count, worker_index);
        }
    }

    pub fn partition_manager(&self) -> Option<&PartitionManager> {
        self.partitions.as_ref()
    }

    pub fn partition_stats(&self) -> Option<Value> {
        self.partitions.as_ref().map(|p| p.session_stats())
    }

    /// Drop expired sticky sessions; called periodically by the worker.
    pub fn cleanup_sessions(&self) {
        if let Some(partitions) = &self.partitions {
            partitions.cleanup_expired_sessions();
        }
    }
}

fn init_routing(settings: &RoutingSettings) -> Result<Option<RoutingEngine>> {
    if !settings.enabled {
        return Ok(None);
    }
    if let Some(path) = &settings.config_path {
        let engine = RoutingEngine::from_file(path)?;
        info!("Routing engine loaded from {}", path);
        return Ok(Some(engine));
    }
    if let Some(inline) = &settings.config_dict {
        let value: Value = serde_json::from_str(inline)
            .map_err(|e| RelayError::config(format!("invalid inline routing config: {}", e)))?;
        let engine = RoutingEngine::from_value(value)?;
        info!("Routing engine loaded from inline configuration");
        return Ok(Some(engine));
    }
    warn!("Routing enabled but no configuration provided");
    Ok(None)
}

/// Authentication headers for an endpoint.
fn auth_headers(endpoint: &EndpointConfig) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    match &endpoint.auth {
        Some(AuthConfig::Bearer { token }) => {
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }
        Some(AuthConfig::Basic { username, password }) => {
            let credentials = BASE64.encode(format!("{}:{}", username, password));
            headers.insert("Authorization".to_string(), format!("Basic {}", credentials));
        }
        Some(AuthConfig::ApiKey { key, header }) => {
            let name = header.clone().unwrap_or_else(|| "X-API-Key".to_string());
            headers.insert(name, key.clone());
        }
        Some(AuthConfig::Custom { header, value }) => {
            headers.insert(header.clone(), value.clone());
        }
        None => {}
    }
    headers
}

/// Outbound header assembly: endpoint statics, then auth, then forwarded
/// client headers filtered by the allow/strip lists.
fn merge_headers(
    endpoint: &EndpointConfig,
    client_headers: Option<&HashMap<String, String>>,
    proxy: &ProxySettings,
) -> HashMap<String, String> {
    let mut headers = endpoint.headers.clone().unwrap_or_default();
    headers.extend(auth_headers(endpoint));

    if let Some(client_headers) = client_headers {
        let allow_all = proxy.forward_headers.iter().any(|h| h == "*");
        for (name, value) in client_headers {
            let stripped = proxy
                .strip_headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name));
            let allowed = allow_all
                || proxy
                    .forward_headers
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(name));
            if allowed && !stripped {
                headers.insert(name.clone(), value.clone());
            }
        }
    }

    headers
}

/// Built-in sample processor used in development mode when no endpoint
/// resolves. Supports echo, uppercase, reverse, and a deliberate error.
fn sample_process(payload: &Value) -> Result<(Value, u16, HashMap<String, String>)> {
    let operation = payload
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let data = payload.get("data").cloned().unwrap_or(Value::Null);

    let output = match operation {
        "echo" => data,
        "uppercase" => Value::String(scalar_string(&data).to_uppercase()),
        "reverse" => Value::String(scalar_string(&data).chars().rev().collect()),
        "error" => return Err(RelayError::fatal("sample processor error")),
        other => Value::String(format!("Unknown operation: {}", other)),
    };

    Ok((
        json!({
            "output": output,
            "processed_at": chrono::Utc::now().to_rfc3339(),
        }),
        200,
        HashMap::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::partition::PartitionSettings;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.proxy.development_mode = true;
        settings
    }

    fn processor(settings: Settings) -> Processor {
        Processor::new(Arc::new(settings), "worker-0").unwrap()
    }

    #[tokio::test]
    async fn sample_processor_operations() {
        let p = processor(settings());
        let meta = RequestMetadata::default();

        let payload = json!({"operation": "echo", "data": "hi"});
        let full = json!({"payload": payload.clone(), "metadata": {}});
        let (body, status, _) = p.process(&payload, &meta, None, &full).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body["output"], "hi");

        let payload = json!({"operation": "uppercase", "data": "hi"});
        let full = json!({"payload": payload.clone(), "metadata": {}});
        let (body, _, _) = p.process(&payload, &meta, None, &full).await.unwrap();
        assert_eq!(body["output"], "HI");

        let payload = json!({"operation": "reverse", "data": "abc"});
        let full = json!({"payload": payload.clone(), "metadata": {}});
        let (body, _, _) = p.process(&payload, &meta, None, &full).await.unwrap();
        assert_eq!(body["output"], "cba");

        let payload = json!({"operation": "error"});
        let full = json!({"payload": payload.clone(), "metadata": {}});
        let err = p.process(&payload, &meta, None, &full).await.unwrap_err();
        assert!(matches!(err, RelayError::FatalProcessing(_)));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_fatal() {
        let mut s = settings();
        s.proxy.enabled = true;
        let p = processor(s);
        let meta = RequestMetadata {
            endpoint: Some("missing".to_string()),
            ..Default::default()
        };
        let payload = json!({});
        let full = json!({"payload": {}, "metadata": {"endpoint": "missing"}});
        let err = p.process(&payload, &meta, None, &full).await.unwrap_err();
        assert!(matches!(err, RelayError::FatalProcessing(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn missing_endpoint_without_dev_mode_is_fatal() {
        let mut s = settings();
        s.proxy.development_mode = false;
        let p = processor(s);
        let payload = json!({"operation": "echo"});
        let full = json!({"payload": payload.clone(), "metadata": {}});
        let err = p
            .process(&payload, &RequestMetadata::default(), None, &full)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::FatalProcessing(_)));
    }

    #[tokio::test]
    async fn partition_skip_acks_with_marker() {
        let mut s = settings();
        s.partitioning = PartitionSettings {
            enabled: true,
            partition_count: 4,
            ..Default::default()
        };
        let p = processor(s);
        // Own no partitions at all, so every keyed message is skipped.
        p.set_partition_assignments(1, 0);
        p.partition_manager()
            .unwrap()
            .set_assigned_partitions(Default::default());

        let payload = json!({"operation": "echo", "data": "x"});
        let full = json!({
            "correlation_id": "cid-1",
            "payload": payload.clone(),
            "metadata": {"session_id": "sess-1"},
        });
        let (body, status, _) = p
            .process(&payload, &RequestMetadata::default(), None, &full)
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, json!({"skipped": true, "reason": "partition_not_assigned"}));
    }

    #[test]
    fn auth_header_variants() {
        let mut endpoint = EndpointConfig::from_url("http://x");
        endpoint.auth = Some(AuthConfig::Bearer {
            token: "tok".to_string(),
        });
        assert_eq!(
            auth_headers(&endpoint).get("Authorization"),
            Some(&"Bearer tok".to_string())
        );

        endpoint.auth = Some(AuthConfig::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        });
        assert_eq!(
            auth_headers(&endpoint).get("Authorization"),
            Some(&format!("Basic {}", BASE64.encode("user:pass")))
        );

        endpoint.auth = Some(AuthConfig::ApiKey {
            key: "k".to_string(),
            header: None,
        });
        assert_eq!(auth_headers(&endpoint).get("X-API-Key"), Some(&"k".to_string()));

        endpoint.auth = Some(AuthConfig::Custom {
            header: "X-Custom".to_string(),
            value: "v".to_string(),
        });
        assert_eq!(auth_headers(&endpoint).get("X-Custom"), Some(&"v".to_string()));
    }

    #[test]
    fn header_merge_respects_allow_and_strip_lists() {
        let endpoint = EndpointConfig::from_url("http://x");
        let proxy = ProxySettings::default();
        let client_headers = HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Host".to_string(), "evil".to_string()),
            ("X-Random".to_string(), "nope".to_string()),
        ]);

        let merged = merge_headers(&endpoint, Some(&client_headers), &proxy);
        assert_eq!(
            merged.get("Content-Type"),
            Some(&"application/json".to_string())
        );
        assert!(!merged.contains_key("Host"));
        assert!(!merged.contains_key("X-Random"));

        let mut allow_all = ProxySettings::default();
        allow_all.forward_headers = vec!["*".to_string()];
        let merged = merge_headers(&endpoint, Some(&client_headers), &allow_all);
        assert!(merged.contains_key("X-Random"));
        // Strip list still applies under allow-all.
        assert!(!merged.contains_key("Host"));
    }
}
