//! REST API: submit requests, query status and results, health, metrics.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::models::{
    meta_key, resp_key, HealthResponse, RequestEnvelope, RequestState, RequestStatus,
    ResponseRecord, ResultResponse, StatusResponse, SubmitRequest, SubmitResponse,
};
use crate::queue::{PublishOptions, QueueBackend};
use crate::store::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn QueueBackend>,
    pub store: Arc<dyn StateStore>,
    pub settings: Arc<Settings>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/submit", post(submit_request))
        .route("/api/v1/status/:correlation_id", get(get_status))
        .route("/api/v1/response/:correlation_id", get(get_response))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Accept a request, persist its initial state, and enqueue it.
///
/// The 202 is sent only after both the state write and the publish
/// succeed, so a cancelled caller never leaves a half-submitted request.
/// If the publish fails after the state write, the caller gets a 503 and
/// the state record simply expires.
async fn submit_request(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Response> {
    if !request.payload.is_object() {
        metrics::HTTP_REQUESTS_TOTAL
            .with_label_values(&["submit", "invalid"])
            .inc();
        return Err(RelayError::validation("payload must be a JSON object"));
    }
    let metadata = request.metadata.unwrap_or_default();
    metadata.validate()?;

    let envelope = RequestEnvelope::new(request.payload, request.headers, metadata);
    let correlation_id = envelope.correlation_id;
    info!("Submitting request {}", correlation_id);

    let pending = RequestState::pending(envelope.timestamp);
    state
        .store
        .set(
            &meta_key(&correlation_id),
            &serde_json::to_value(&pending)?,
            Some(state.settings.request_ttl()),
        )
        .await?;

    let message = envelope.to_value()?;
    let publish_result = state
        .queue
        .publish(
            &state.settings.queue.request_queue_name,
            &message,
            PublishOptions {
                priority: envelope.metadata.priority,
                ..Default::default()
            },
        )
        .await;

    let queue_name = &state.settings.queue.request_queue_name;
    if let Err(e) = publish_result {
        warn!("Failed to queue request {}: {}", correlation_id, e);
        metrics::QUEUE_PUBLISH_TOTAL
            .with_label_values(&[queue_name, "failed"])
            .inc();
        metrics::HTTP_REQUESTS_TOTAL
            .with_label_values(&["submit", "unavailable"])
            .inc();
        return Err(RelayError::service_unavailable(
            "unable to queue request; service temporarily unavailable",
        ));
    }

    metrics::QUEUE_PUBLISH_TOTAL
        .with_label_values(&[queue_name, "success"])
        .inc();
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&["submit", "accepted"])
        .inc();

    let body = SubmitResponse {
        correlation_id,
        status: RequestStatus::Pending,
        submitted_at: envelope.timestamp,
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

async fn get_status(
    State(state): State<AppState>,
    Path(correlation_id): Path<Uuid>,
) -> Result<Json<StatusResponse>> {
    let request_state = load_state(&state, &correlation_id).await?;
    Ok(Json(StatusResponse {
        correlation_id,
        status: request_state.status,
        submitted_at: request_state.submitted_at,
        updated_at: request_state.updated_at,
    }))
}

async fn get_response(
    State(state): State<AppState>,
    Path(correlation_id): Path<Uuid>,
) -> Result<Response> {
    let request_state = load_state(&state, &correlation_id).await?;

    let record: Option<ResponseRecord> = state
        .store
        .get(&resp_key(&correlation_id))
        .await?
        .map(serde_json::from_value)
        .transpose()?;

    let response = match (request_state.status, record) {
        (RequestStatus::Completed, Some(record)) => {
            let body = ResultResponse {
                correlation_id,
                status: RequestStatus::Completed,
                result: record.result,
                headers: record.headers,
                status_code: record.status_code,
                error: None,
                processing_time_ms: record.processing_time_ms,
                completed_at: Some(record.completed_at),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        (RequestStatus::Failed, record) => {
            let body = ResultResponse {
                correlation_id,
                status: RequestStatus::Failed,
                result: None,
                headers: None,
                status_code: None,
                error: Some(
                    record
                        .as_ref()
                        .and_then(|r| r.error.clone())
                        .unwrap_or_else(|| "Processing failed".to_string()),
                ),
                processing_time_ms: None,
                completed_at: record.map(|r| r.completed_at),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        (status, _) => {
            // Still in flight (or the record has expired ahead of the
            // state); report progress with 202.
            let body = ResultResponse {
                correlation_id,
                status,
                result: None,
                headers: None,
                status_code: None,
                error: None,
                processing_time_ms: None,
                completed_at: None,
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
    };
    Ok(response)
}

async fn load_state(state: &AppState, correlation_id: &Uuid) -> Result<RequestState> {
    let value = state
        .store
        .get(&meta_key(correlation_id))
        .await?
        .ok_or_else(|| RelayError::not_found("request not found or expired"))?;
    Ok(serde_json::from_value(value)?)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut components = HashMap::new();

    let queue_healthy = state.queue.health_check().await;
    components.insert(
        "queue".to_string(),
        if queue_healthy { "healthy" } else { "unhealthy" }.to_string(),
    );

    let store_healthy = state.store.health_check().await;
    components.insert(
        "store".to_string(),
        if store_healthy { "healthy" } else { "unhealthy" }.to_string(),
    );

    if let Ok(depth) = state
        .queue
        .queue_depth(&state.settings.queue.request_queue_name)
        .await
    {
        components.insert("queue_depth".to_string(), depth.to_string());
    }

    let status = match (queue_healthy, store_healthy) {
        (true, true) => "healthy",
        (false, false) => "unhealthy",
        _ => "degraded",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: crate::VERSION.to_string(),
        timestamp: chrono::Utc::now(),
        components,
    })
}

async fn render_metrics(State(state): State<AppState>) -> Result<Response> {
    if !state.settings.monitoring.metrics_enabled {
        return Err(RelayError::not_found("metrics collection is disabled"));
    }
    let text = metrics::render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}
