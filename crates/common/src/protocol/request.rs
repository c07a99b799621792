use serde::{Deserialize, Serialize};

use crate::utils::Headers;

/// Header carrying the end-to-end request correlation id
pub const REQUEST_ID_HEADER: &str = "snyk-request-id";

/// Header selecting a per-context configuration
pub const CONTEXT_ID_HEADER: &str = "x-snyk-broker-context-id";

/// An HTTP request as it crosses the tunnel
///
/// Produced at the tunnel boundary, then filtered and rewritten in place by the
/// matcher and transformer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Path and query string, e.g. "/repos/org/repo?ref=main"
    pub url: String,

    /// HTTP method, any case
    pub method: String,

    #[serde(default)]
    pub headers: Headers,

    /// Request body as text, JSON bodies are parsed lazily by the matcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Set when the response should be POSTed back out of band
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_id: Option<String>,

    /// Credential identifier of the connection the request belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_identifier: Option<String>,
}

impl RequestPayload {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(REQUEST_ID_HEADER)
    }

    /// Set `snyk-request-id` if absent and return it
    pub fn ensure_request_id(&mut self) -> String {
        if let Some(id) = self.request_id() {
            return id.to_string();
        }
        let id = crate::utils::generate_request_id();
        self.headers.insert(REQUEST_ID_HEADER, id.clone());
        id
    }

    pub fn context_id(&self) -> Option<&str> {
        self.headers.get(CONTEXT_ID_HEADER)
    }

    /// Body length in bytes
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(String::len).unwrap_or(0)
    }
}
