//! Error handling and sanitization
//!
//! Full details are logged; callers only see messages that are safe to show.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use broker_common::BrokerError;
use serde_json::json;
use tracing::error;

/// Log an internal error and return a generic message
pub fn sanitize_error(e: &anyhow::Error) -> String {
    error!("Internal error: {:#}", e);
    "Internal server error".to_string()
}

/// Log an error and return a custom generic message
pub fn sanitize_error_with_message(e: &anyhow::Error, client_message: &str) -> String {
    error!("Error ({}): {:#}", client_message, e);
    client_message.to_string()
}

/// Message shown to callers: the error itself when safe, otherwise a generic one
pub fn client_message(e: &BrokerError) -> String {
    if e.is_safe() {
        error!("Client error: {}", e);
        e.to_string()
    } else {
        sanitize_error(&anyhow::anyhow!(e.to_string()))
    }
}

/// JSON error response with the status mapped from the error
pub fn error_response(e: &BrokerError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "message": client_message(e) }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_sanitize_error_hides_details() {
        let err = anyhow!("Failed to connect to 10.0.1.5:8000");
        let sanitized = sanitize_error(&err);

        assert_eq!(sanitized, "Internal server error");
        assert!(!sanitized.contains("10.0.1.5"));
    }

    #[test]
    fn test_sanitize_error_with_custom_message() {
        let err = anyhow!("primary replica refused connection");
        let sanitized = sanitize_error_with_message(&err, "Error forwarding request to primary.");
        assert_eq!(sanitized, "Error forwarding request to primary.");
    }

    #[test]
    fn test_client_message() {
        let safe = BrokerError::UpstreamTimeout { buffered_bytes: 0 };
        assert!(client_message(&safe).contains("Timeout"));

        let unsafe_err = BrokerError::DownstreamUnavailable("dns error for internal.host".to_string());
        assert_eq!(client_message(&unsafe_err), "Internal server error");
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(&BrokerError::UpstreamTimeout { buffered_bytes: 0 });
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = error_response(&BrokerError::ConnectionError("closed".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
