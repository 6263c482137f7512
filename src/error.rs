use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Crate-wide error type.
///
/// The worker is the only place that converts errors into user-visible
/// request state; everything below it returns typed variants so the retry
/// policy can distinguish transient failures from fatal ones.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Transient queue error: {0}")]
    TransientQueue(String),

    #[error("Fatal queue error: {0}")]
    FatalQueue(String),

    #[error("Transient processing error: {0}")]
    TransientProcessing(String),

    #[error("Fatal processing error: {0}")]
    FatalProcessing(String),

    #[error("Message assigned to different partition: {0}")]
    PartitionSkip(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl RelayError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        RelayError::Validation(msg.into())
    }

    pub fn routing<S: Into<String>>(msg: S) -> Self {
        RelayError::Routing(msg.into())
    }

    pub fn transform<S: Into<String>>(msg: S) -> Self {
        RelayError::Transform(msg.into())
    }

    pub fn transient_queue<S: Into<String>>(msg: S) -> Self {
        RelayError::TransientQueue(msg.into())
    }

    pub fn fatal_queue<S: Into<String>>(msg: S) -> Self {
        RelayError::FatalQueue(msg.into())
    }

    pub fn transient<S: Into<String>>(msg: S) -> Self {
        RelayError::TransientProcessing(msg.into())
    }

    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        RelayError::FatalProcessing(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        RelayError::Store(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        RelayError::NotFound(msg.into())
    }

    pub fn service_unavailable<S: Into<String>>(msg: S) -> Self {
        RelayError::ServiceUnavailable(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        RelayError::Internal(msg.into())
    }

    /// Whether the retry policy may republish the message.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::TransientQueue(_) | RelayError::TransientProcessing(_)
        )
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, error_message, error_code) = match &self {
            RelayError::Validation(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                self.to_string(),
                "VALIDATION_ERROR",
            ),
            RelayError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string(), "NOT_FOUND")
            }
            RelayError::Config(_) => {
                (StatusCode::BAD_REQUEST, self.to_string(), "CONFIG_ERROR")
            }
            RelayError::TransientQueue(_) | RelayError::ServiceUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable".to_string(),
                "SERVICE_UNAVAILABLE",
            ),
            RelayError::Store(_) | RelayError::Redis(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "State store operation failed".to_string(),
                "STORE_ERROR",
            ),
            RelayError::Serialization(_) => (
                StatusCode::BAD_REQUEST,
                "Data serialization failed".to_string(),
                "SERIALIZATION_ERROR",
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected error occurred".to_string(),
                "INTERNAL_ERROR",
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": error_message,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RelayError::transient("upstream 503").is_transient());
        assert!(RelayError::transient_queue("broker blip").is_transient());
        assert!(!RelayError::fatal("unknown endpoint").is_transient());
        assert!(!RelayError::fatal_queue("bad credentials").is_transient());
        assert!(!RelayError::validation("bad payload").is_transient());
    }
}
