use thiserror::Error;

/// Error types for the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Request does not match any accept rule: {reason}")]
    AuthorizationDenied { reason: String, url: String },

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("Timeout relaying to peer ({buffered_bytes} bytes in flight)")]
    UpstreamTimeout { buffered_bytes: u64 },

    #[error("Credential rejected with status {0}")]
    CredentialInvalid(u16),

    #[error("Broker version {version} is below the minimum supported {minimum}")]
    ProtocolVersionRejected { version: String, minimum: String },

    #[error("Unable to find request matching streaming id {0}")]
    StreamNotFound(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl BrokerError {
    /// HTTP status used when this error is surfaced to a caller
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::AuthorizationDenied { .. } => 401,
            BrokerError::CredentialInvalid(status) => *status,
            BrokerError::UpstreamTimeout { .. } => 504,
            BrokerError::InvalidMessage(_) => 400,
            BrokerError::ProtocolVersionRejected { .. } => 426,
            _ => 500,
        }
    }

    /// Whether the message can be shown to callers without leaking internals
    pub fn is_safe(&self) -> bool {
        matches!(
            self,
            BrokerError::AuthorizationDenied { .. }
                | BrokerError::UpstreamTimeout { .. }
                | BrokerError::StreamNotFound(_)
                | BrokerError::ProtocolVersionRejected { .. }
                | BrokerError::InvalidMessage(_)
        )
    }
}

/// Type alias for Results using BrokerError
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::ConfigurationInvalid("missing context".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: missing context");

        let err = BrokerError::StreamNotFound("abc".to_string());
        assert_eq!(
            err.to_string(),
            "Unable to find request matching streaming id abc"
        );
    }

    #[test]
    fn test_status_codes() {
        let denied = BrokerError::AuthorizationDenied {
            reason: "no rule".to_string(),
            url: "/x".to_string(),
        };
        assert_eq!(denied.status_code(), 401);
        assert_eq!(BrokerError::CredentialInvalid(403).status_code(), 403);
        assert_eq!(
            BrokerError::UpstreamTimeout { buffered_bytes: 10 }.status_code(),
            504
        );
        assert_eq!(
            BrokerError::DownstreamUnavailable("dns".to_string()).status_code(),
            500
        );
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_err.is_err());

        let broker_err: BrokerError = json_err.unwrap_err().into();
        assert!(matches!(broker_err, BrokerError::SerializationError(_)));
        assert!(!broker_err.is_safe());
    }
}
