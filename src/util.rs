//! Small helpers shared across the crate.

use serde_json::Value;

/// Resolve a dot-separated path against a JSON value.
///
/// Returns `None` when any segment is missing or the intermediate value is
/// not an object. `nested_value(m, "metadata.user.id")` walks
/// `m["metadata"]["user"]["id"]`.
pub fn nested_value<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for key in path.split('.') {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// Render a JSON value the way it should appear inside a header, query
/// parameter, or template slot: strings verbatim, everything else as
/// compact JSON.
pub fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Current epoch time in whole seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current epoch time in milliseconds.
pub fn epoch_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Resolve when SIGTERM or SIGINT arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_value_walks_objects() {
        let data = json!({"metadata": {"user": {"id": 123}}});
        assert_eq!(nested_value(&data, "metadata.user.id"), Some(&json!(123)));
        assert_eq!(nested_value(&data, "metadata.user.name"), None);
        assert_eq!(nested_value(&data, "missing.path"), None);
    }

    #[test]
    fn nested_value_stops_at_scalars() {
        let data = json!({"a": 1});
        assert_eq!(nested_value(&data, "a.b"), None);
    }

    #[test]
    fn scalar_string_formats() {
        assert_eq!(scalar_string(&json!("plain")), "plain");
        assert_eq!(scalar_string(&json!(42)), "42");
        assert_eq!(scalar_string(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(scalar_string(&json!(true)), "true");
    }
}
