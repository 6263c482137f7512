//! Prometheus metrics, registered on the default registry.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

use crate::error::{RelayError, Result};

pub static QUEUE_PUBLISH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "relayq_queue_publish_total",
        "Messages published per queue and outcome",
        &["queue", "status"]
    )
    .expect("metric registration")
});

pub static QUEUE_DLQ_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "relayq_queue_dlq_total",
        "Messages sent to the dead letter queue",
        &["reason"]
    )
    .expect("metric registration")
});

pub static WORKER_PROCESSING_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "relayq_worker_processing_seconds",
        "Per-message processing duration",
        &["status"]
    )
    .expect("metric registration")
});

pub static WORKER_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "relayq_worker_errors_total",
        "Worker errors by classification",
        &["error_type"]
    )
    .expect("metric registration")
});

pub static WORKER_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "relayq_worker_active",
        "Whether a worker is running",
        &["worker_id"]
    )
    .expect("metric registration")
});

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "relayq_http_requests_total",
        "API requests by handler and outcome",
        &["handler", "status"]
    )
    .expect("metric registration")
});

/// Render all registered metrics in the Prometheus text exposition format.
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| RelayError::internal(format!("metrics encoding failed: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| RelayError::internal(format!("metrics encoding failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metrics() {
        QUEUE_PUBLISH_TOTAL
            .with_label_values(&["relayq-requests", "success"])
            .inc();
        let text = render().unwrap();
        assert!(text.contains("relayq_queue_publish_total"));
    }
}
