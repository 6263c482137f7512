//! End-to-end worker tests: in-memory broker and store, wiremock upstreams.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use relayq::config::{EndpointConfig, QueueType, Settings};
use relayq::models::{
    meta_key, resp_key, RequestEnvelope, RequestMetadata, RequestState, RequestStatus,
};
use relayq::partition::{PartitionSettings, SkipPolicy};
use relayq::processor::Processor;
use relayq::queue::memory::MemoryQueue;
use relayq::queue::{PublishOptions, QueueBackend};
use relayq::store::{MemoryStore, StateStore};
use relayq::worker::Worker;

/// Responds with the request body unchanged, like a real echo service.
struct EchoResponder;

impl Respond for EchoResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        ResponseTemplate::new(200).set_body_json(body)
    }
}

struct Harness {
    settings: Arc<Settings>,
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryStore>,
    worker: Arc<Worker>,
    task: tokio::task::JoinHandle<relayq::Result<()>>,
}

impl Harness {
    async fn start(settings: Settings) -> Self {
        Self::start_with(settings, |_| {}).await
    }

    /// Start a worker, with a hook to adjust the processor before the
    /// consume loop begins (partition assignments, mostly).
    async fn start_with(settings: Settings, configure: impl FnOnce(&Processor)) -> Self {
        let settings = Arc::new(settings);
        let queue = Arc::new(MemoryQueue::new(&settings.queue));
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(Processor::new(settings.clone(), "worker-0").unwrap());
        configure(&processor);

        let worker = Arc::new(Worker::new(
            "worker-0".to_string(),
            queue.clone() as Arc<dyn QueueBackend>,
            store.clone() as Arc<dyn StateStore>,
            processor,
            settings.clone(),
        ));
        let task = tokio::spawn(worker.clone().start());

        Self {
            settings,
            queue,
            store,
            worker,
            task,
        }
    }

    async fn submit(&self, payload: Value, metadata: RequestMetadata) -> Uuid {
        let envelope = RequestEnvelope::new(payload, None, metadata);
        let correlation_id = envelope.correlation_id;
        let pending = RequestState::pending(envelope.timestamp);
        self.store
            .set(
                &meta_key(&correlation_id),
                &serde_json::to_value(&pending).unwrap(),
                Some(3600),
            )
            .await
            .unwrap();
        self.queue
            .publish(
                &self.settings.queue.request_queue_name,
                &envelope.to_value().unwrap(),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        correlation_id
    }

    async fn wait_for_status(&self, correlation_id: &Uuid, expected: RequestStatus) -> Value {
        let key = meta_key(correlation_id);
        let expected = serde_json::to_value(expected).unwrap();
        for _ in 0..200 {
            if let Some(state) = self.store.get(&key).await.unwrap() {
                if state["status"] == expected {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("request {} never reached {:?}", correlation_id, expected);
    }

    /// The response record is written just after the state transition, so
    /// reads poll briefly.
    async fn wait_for_record(&self, correlation_id: &Uuid) -> Value {
        let key = resp_key(correlation_id);
        for _ in 0..40 {
            if let Some(record) = self.store.get(&key).await.unwrap() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("request {} never got a response record", correlation_id);
    }

    async fn stop(self) {
        self.worker.shutdown().await.unwrap();
        let _ = self.task.await;
    }
}

fn base_settings() -> Settings {
    let mut settings = Settings::default();
    settings.queue.queue_type = QueueType::Memory;
    settings.cache.cache_type = relayq::config::CacheType::Memory;
    settings.proxy.enabled = true;
    settings.worker.max_retries = 3;
    // Retries run immediately in tests.
    settings.worker.retry_delay_base = 0.0;
    settings
}

fn with_endpoint(mut settings: Settings, name: &str, url: String) -> Settings {
    settings
        .proxy
        .endpoints
        .insert(name.to_string(), EndpointConfig::from_url(url));
    settings
}

#[tokio::test]
async fn happy_path_passthrough() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/echo"))
        .respond_with(EchoResponder)
        .mount(&server)
        .await;

    let mut settings = with_endpoint(base_settings(), "echo", format!("{}/echo", server.uri()));
    settings.proxy.default_endpoint = Some("echo".to_string());
    let harness = Harness::start(settings).await;

    let cid = harness
        .submit(
            json!({"operation": "echo", "data": "hi"}),
            RequestMetadata::default(),
        )
        .await;

    harness.wait_for_status(&cid, RequestStatus::Completed).await;

    let record = harness.wait_for_record(&cid).await;
    assert_eq!(record["result"]["operation"], "echo");
    assert_eq!(record["result"]["data"], "hi");
    assert_eq!(record["status_code"], 200);
    assert!(record["processing_time_ms"].is_u64());

    // The result is mirrored to the response queue for fan-out consumers.
    // The mirror publish happens just after the state write, so poll.
    let mut mirror = None;
    for _ in 0..40 {
        mirror = harness
            .queue
            .try_pop(&harness.settings.queue.response_queue_name);
        if mirror.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let mirror = mirror.expect("mirrored response");
    assert_eq!(mirror.body["correlation_id"], cid.to_string());
    assert_eq!(mirror.body["status"], "COMPLETED");

    harness.stop().await;
}

#[tokio::test]
async fn routed_template_transform_reaches_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sent": true})))
        .mount(&server)
        .await;

    let mut settings = with_endpoint(
        base_settings(),
        "notification",
        format!("{}/notify", server.uri()),
    );
    settings.routing.enabled = true;
    settings.routing.config_dict = Some(
        json!({
            "version": "1.0",
            "routes": [{
                "name": "notifications",
                "priority": 10,
                "match_field": "metadata.type",
                "match_pattern": "^notification\\.",
                "endpoint": "notification",
                "transform_type": "template",
                "transform": r#"{"to": "{{payload.user.email}}", "msg": "{{payload.message}}"}"#,
            }],
            "enable_fallback": false,
        })
        .to_string(),
    );
    let harness = Harness::start(settings).await;

    let cid = harness
        .submit(
            json!({"user": {"email": "a@b"}, "message": "hi"}),
            RequestMetadata {
                extra: std::collections::HashMap::from([(
                    "type".to_string(),
                    json!("notification.email"),
                )]),
                ..Default::default()
            },
        )
        .await;

    harness.wait_for_status(&cid, RequestStatus::Completed).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let outbound: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(outbound, json!({"to": "a@b", "msg": "hi"}));

    harness.stop().await;
}

#[tokio::test]
async fn transient_upstream_errors_retry_then_succeed() {
    let server = MockServer::start().await;
    // Two failures, then echo.
    Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(EchoResponder)
        .mount(&server)
        .await;

    let settings = with_endpoint(base_settings(), "flaky", format!("{}/flaky", server.uri()));
    let harness = Harness::start(settings).await;

    let cid = harness
        .submit(
            json!({"attempt": "retry"}),
            RequestMetadata {
                endpoint: Some("flaky".to_string()),
                ..Default::default()
            },
        )
        .await;

    harness.wait_for_status(&cid, RequestStatus::Completed).await;

    // Original publish plus exactly two retry republishes.
    assert_eq!(
        harness
            .queue
            .published_total(&harness.settings.queue.request_queue_name),
        3
    );
    assert_eq!(
        harness
            .queue
            .published_total(&harness.settings.queue.dlq_name),
        0
    );

    harness.stop().await;
}

#[tokio::test]
async fn retry_exhaustion_dead_letters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut settings =
        with_endpoint(base_settings(), "broken", format!("{}/broken", server.uri()));
    settings.worker.max_retries = 2;
    let harness = Harness::start(settings).await;

    let cid = harness
        .submit(
            json!({"doomed": true}),
            RequestMetadata {
                endpoint: Some("broken".to_string()),
                ..Default::default()
            },
        )
        .await;

    harness.wait_for_status(&cid, RequestStatus::Failed).await;

    // retry_count == max_retries goes to the DLQ, not back on the queue.
    assert_eq!(
        harness
            .queue
            .published_total(&harness.settings.queue.request_queue_name),
        3
    );
    let dead = harness
        .queue
        .try_pop(&harness.settings.queue.dlq_name)
        .expect("DLQ message");
    assert_eq!(dead.body["correlation_id"], cid.to_string());
    assert_eq!(dead.body["worker_id"], "worker-0");
    assert!(dead.body["error"].as_str().unwrap().contains("500"));
    assert!(dead.body["failed_at"].is_string());

    let record = harness.wait_for_record(&cid).await;
    assert!(record["error"].as_str().unwrap().contains("500"));

    harness.stop().await;
}

#[tokio::test]
async fn unknown_endpoint_fails_without_retry() {
    let harness = Harness::start(base_settings()).await;

    let cid = harness
        .submit(
            json!({"x": 1}),
            RequestMetadata {
                endpoint: Some("missing".to_string()),
                ..Default::default()
            },
        )
        .await;

    harness.wait_for_status(&cid, RequestStatus::Failed).await;

    // One attempt only: the original publish, no republishes.
    assert_eq!(
        harness
            .queue
            .published_total(&harness.settings.queue.request_queue_name),
        1
    );
    let dead = harness
        .queue
        .try_pop(&harness.settings.queue.dlq_name)
        .expect("DLQ message");
    assert_eq!(dead.body["correlation_id"], cid.to_string());
    assert!(dead.body["error"]
        .as_str()
        .unwrap()
        .contains("unknown endpoint"));

    harness.stop().await;
}

#[tokio::test]
async fn unowned_partition_skips_and_acks() {
    let mut settings = base_settings();
    settings.proxy.enabled = false;
    settings.proxy.development_mode = true;
    settings.partitioning = PartitionSettings {
        enabled: true,
        partition_count: 4,
        ..Default::default()
    };

    let harness = Harness::start_with(settings, |processor| {
        // Own nothing, so every keyed message is skipped.
        processor
            .partition_manager()
            .unwrap()
            .set_assigned_partitions(Default::default());
    })
    .await;

    let cid = harness
        .submit(
            json!({"operation": "echo", "data": "x"}),
            RequestMetadata {
                session_id: Some("sess-X".to_string()),
                ..Default::default()
            },
        )
        .await;

    harness.wait_for_status(&cid, RequestStatus::Completed).await;

    let record = harness.wait_for_record(&cid).await;
    assert_eq!(record["result"]["skipped"], true);
    assert_eq!(record["result"]["reason"], "partition_not_assigned");
    // Skipped, acked, not retried.
    assert_eq!(
        harness
            .queue
            .published_total(&harness.settings.queue.request_queue_name),
        1
    );

    harness.stop().await;
}

#[tokio::test]
async fn unowned_partition_requeues_under_requeue_policy() {
    let mut settings = base_settings();
    settings.proxy.enabled = false;
    settings.proxy.development_mode = true;
    settings.partitioning = PartitionSettings {
        enabled: true,
        partition_count: 4,
        skip_policy: SkipPolicy::Requeue,
        ..Default::default()
    };

    let harness = Harness::start_with(settings, |processor| {
        processor
            .partition_manager()
            .unwrap()
            .set_assigned_partitions(Default::default());
    })
    .await;

    let cid = harness
        .submit(
            json!({"operation": "echo", "data": "x"}),
            RequestMetadata {
                session_id: Some("sess-X".to_string()),
                ..Default::default()
            },
        )
        .await;

    // The lone worker keeps handing the message back; it must never
    // complete and the republish count keeps growing.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let state = harness
        .store
        .get(&meta_key(&cid))
        .await
        .unwrap()
        .expect("state record");
    assert_ne!(state["status"], "COMPLETED");
    assert_ne!(state["status"], "FAILED");
    assert!(
        harness
            .queue
            .published_total(&harness.settings.queue.request_queue_name)
            >= 2
    );

    harness.stop().await;
}

#[tokio::test]
async fn worker_timeout_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let mut settings = with_endpoint(base_settings(), "slow", format!("{}/slow", server.uri()));
    settings.worker.timeout_seconds = 1;
    settings.worker.max_retries = 0;
    let harness = Harness::start(settings).await;

    let cid = harness
        .submit(
            json!({"x": 1}),
            RequestMetadata {
                endpoint: Some("slow".to_string()),
                ..Default::default()
            },
        )
        .await;

    // max_retries = 0: the first transient failure dead-letters.
    harness.wait_for_status(&cid, RequestStatus::Failed).await;
    let dead = harness
        .queue
        .try_pop(&harness.settings.queue.dlq_name)
        .expect("DLQ message");
    assert_eq!(dead.body["correlation_id"], cid.to_string());

    harness.stop().await;
}
