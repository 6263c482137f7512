//! Data models for queue messages, persisted state, and the HTTP API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Request processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl RequestStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Timeout
        )
    }
}

/// Caller-supplied processing hints carried with every queue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestMetadata {
    /// Priority level, 0-9.
    pub priority: u8,
    /// Processing timeout in seconds.
    pub timeout: u64,
    /// Current retry count, incremented on each republish.
    pub retry_count: u32,
    /// Target endpoint name.
    pub endpoint: Option<String>,
    /// HTTP method override.
    pub method: Option<String>,
    /// Session identifier for sticky affinity.
    pub session_id: Option<String>,
    /// Explicit partition key, preferred over the session id.
    pub partition_key: Option<String>,
    /// Caller-defined fields, preserved for route matching.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self {
            priority: 0,
            timeout: 300,
            retry_count: 0,
            endpoint: None,
            method: None,
            session_id: None,
            partition_key: None,
            extra: HashMap::new(),
        }
    }
}

impl RequestMetadata {
    pub fn validate(&self) -> Result<()> {
        if self.priority > 9 {
            return Err(RelayError::validation(format!(
                "priority must be between 0 and 9, got {}",
                self.priority
            )));
        }
        if self.timeout == 0 {
            return Err(RelayError::validation("timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// The immutable message published to the request queue by the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: Uuid,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Submission timestamp.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl RequestEnvelope {
    pub fn new(
        payload: Value,
        headers: Option<HashMap<String, String>>,
        metadata: RequestMetadata,
    ) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            payload,
            headers,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// The full message as JSON, the shape routing and partitioning match on.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Mutable per-request record under `req:{cid}:meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestState {
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestState {
    pub fn pending(submitted_at: DateTime<Utc>) -> Self {
        Self {
            status: RequestStatus::Pending,
            submitted_at,
            updated_at: submitted_at,
        }
    }

    pub fn with_status(&self, status: RequestStatus) -> Self {
        Self {
            status,
            submitted_at: self.submitted_at,
            updated_at: Utc::now(),
        }
    }
}

/// Result record under `resp:{cid}`; exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

impl ResponseRecord {
    pub fn success(
        result: Value,
        status_code: u16,
        headers: HashMap<String, String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            result: Some(result),
            error: None,
            status_code: Some(status_code),
            headers: Some(headers),
            processing_time_ms: Some(processing_time_ms),
            completed_at: Utc::now(),
        }
    }

    pub fn failure(error: String) -> Self {
        Self {
            result: None,
            error: Some(error),
            status_code: None,
            headers: None,
            processing_time_ms: None,
            completed_at: Utc::now(),
        }
    }
}

/// State store key for request metadata.
pub fn meta_key(correlation_id: &Uuid) -> String {
    format!("req:{}:meta", correlation_id)
}

/// State store key for the response record.
pub fn resp_key(correlation_id: &Uuid) -> String {
    format!("resp:{}", correlation_id)
}

// API request/response bodies.

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub payload: Value,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub correlation_id: Uuid,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub correlation_id: Uuid,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultResponse {
    pub correlation_id: Uuid,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub components: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_bounds() {
        let mut meta = RequestMetadata::default();
        assert!(meta.validate().is_ok());

        meta.priority = 9;
        assert!(meta.validate().is_ok());

        meta.priority = 10;
        assert!(meta.validate().is_err());

        meta.priority = 0;
        meta.timeout = 0;
        assert!(meta.validate().is_err());
    }

    #[test]
    fn metadata_preserves_extra_fields() {
        let meta: RequestMetadata = serde_json::from_value(json!({
            "priority": 3,
            "type": "notification.email",
        }))
        .unwrap();
        assert_eq!(meta.priority, 3);
        assert_eq!(meta.extra["type"], "notification.email");

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["type"], "notification.email");
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = RequestEnvelope::new(
            json!({"operation": "echo", "data": "hi"}),
            None,
            RequestMetadata::default(),
        );
        let value = envelope.to_value().unwrap();
        assert_eq!(value["payload"]["operation"], "echo");

        let back = RequestEnvelope::from_value(&value).unwrap();
        assert_eq!(back.correlation_id, envelope.correlation_id);
        assert_eq!(back.metadata.retry_count, 0);
    }

    #[test]
    fn status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&RequestStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::to_string(&RequestStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
    }

    #[test]
    fn state_keys() {
        let cid = Uuid::nil();
        assert_eq!(
            meta_key(&cid),
            "req:00000000-0000-0000-0000-000000000000:meta"
        );
        assert_eq!(resp_key(&cid), "resp:00000000-0000-0000-0000-000000000000");
    }
}
