use serde::{Deserialize, Serialize};

use super::{RequestPayload, ResponsePayload};
use crate::models::ClientMetadata;
use crate::stream::StreamHead;

/// All tunnel messages are wrapped in this typed envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Control plane messages
    Ping,
    Pong,

    /// Identification handshake: server challenge, then client answer
    IdentifyRequest {
        #[serde(default)]
        capabilities: Vec<String>,
    },
    Identify(Identification),

    /// Data plane messages, correlated by `id`
    Request {
        id: String,
        payload: RequestPayload,
    },
    Response {
        id: String,
        payload: ResponsePayload,
    },

    /// Legacy in-band streamed body
    Chunk {
        streaming_id: String,
        /// Base64 encoded bytes
        #[serde(default)]
        data: String,
        #[serde(default)]
        finished: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        head: Option<StreamHead>,
        /// Destination body failed; the receiver aborts the stream
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Server to client banner
    Notification {
        level: NotificationLevel,
        message: String,
    },

    /// Out-of-band control command, answered with a `Response` carrying the same id
    Service {
        id: String,
        command: String,
    },

    /// Graceful shutdown notice
    Terminate {
        signal: String,
    },

    /// Error handling
    Error {
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

/// Client answer to the identify challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identification {
    pub token: String,
    pub metadata: ClientMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Warning,
    Error,
}

/// Error codes for tunnel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    VersionRejected,
    Timeout,
    DownstreamUnavailable,
    InternalError,
}

impl Message {
    /// Serialize into a websocket text frame payload
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| crate::BrokerError::InvalidMessage(format!("Failed to parse message: {}", e)))
    }
}
