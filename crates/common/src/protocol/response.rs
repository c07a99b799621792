use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::utils::{Headers, decode_body, encode_body};

/// A buffered HTTP response sent back through the tunnel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// HTTP status code (200, 404, 500, etc.)
    pub status: u16,

    #[serde(default)]
    pub headers: Headers,

    /// Response body encoded in Base64
    #[serde(default)]
    pub body: String,

    /// Classifies relay failures, e.g. "DOWNSTREAM_UNAVAILABLE"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_body_size: Option<usize>,
}

impl ResponsePayload {
    pub fn from_bytes(status: u16, headers: Headers, body: &[u8]) -> Self {
        Self {
            status,
            headers,
            body: encode_body(body),
            error_type: None,
            original_body_size: Some(body.len()),
        }
    }

    /// JSON response with a matching content type
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type", "application/json");
        Self::from_bytes(status, headers, value.to_string().as_bytes())
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        Ok(decode_body(&self.body)?)
    }

    /// Check if the response is successful (2xx status code)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
