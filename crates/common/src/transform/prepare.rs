use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::interpolate::Interpolated;
use crate::config::EffectiveConfig;
use crate::constants::BROKER_VERSION;
use crate::plugins::{PluginError, PluginRegistry};
use crate::protocol::RequestPayload;
use crate::utils::{Headers, json_to_form};

/// Headers that corrupt a relayed request or leak caller identity
const STRIPPED_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-forwarded-proto",
    "content-length",
    "host",
    "x-forwarded-host",
    "x-forwarded-port",
    "snyk-acting-group-public-id",
    "snyk-acting-org-public-id",
    "snyk-acting-user-public-id",
    "snyk-flow-name",
    "snyk-product-line",
    "snyk-project-type",
    "snyk-integration-type",
];

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// The request actually sent to the destination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreparedRequest {
    pub url: String,
    pub method: String,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PrepareError {
    pub status: u16,
    pub message: String,
}

impl PrepareError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<PluginError> for PrepareError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Blocking { status, message } => Self { status, message },
            other => Self::new(500, other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Strip every `x-forwarded-*` and `forwarded` header
    pub remove_x_forwarded_headers: bool,

    /// Set on the server side, sent as `x-broker-token`
    pub broker_token: Option<String>,

    pub user_agent: String,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            remove_x_forwarded_headers: false,
            broker_token: None,
            user_agent: format!("Snyk Broker {}", BROKER_VERSION),
        }
    }
}

/// Build the outgoing request from an interpolated rule result
pub fn prepare(
    interpolated: Interpolated,
    payload: &RequestPayload,
    options: &PrepareOptions,
) -> Result<PreparedRequest, PrepareError> {
    let mut url = interpolated.url;
    if !url.starts_with("http") {
        url = format!("https://{}", url);
    }

    let mut parsed = Url::parse(&url)
        .map_err(|e| PrepareError::new(400, format!("Invalid destination url {}: {}", url, e)))?;

    let mut headers = payload.headers.clone();
    if !headers.contains("user-agent") {
        headers.insert("user-agent", options.user_agent.clone());
    }

    if let Some(auth) = interpolated.auth {
        headers.insert("authorization", auth);
    } else if !parsed.username().is_empty() {
        if parsed.password().is_some() {
            // basic credentials stay on the url for the client to apply
            headers.remove("authorization");
        } else {
            headers.insert("authorization", format!("token {}", parsed.username()));
            if parsed.set_username("").is_err() {
                return Err(PrepareError::new(400, format!("Invalid destination url {}", url)));
            }
            url = parsed.to_string();
        }
    }

    headers.retain(|name| !STRIPPED_HEADERS.contains(&name));
    if options.remove_x_forwarded_headers {
        headers.retain(|name| !name.starts_with("x-forwarded-") && name != "forwarded");
    }

    if let Some(token) = &options.broker_token {
        headers.insert("x-broker-token", token.clone());
    }

    headers.insert("connection", "Keep-Alive");
    headers.insert("keep-alive", "timeout=60, max=1000");

    let mut body = payload.body.clone();
    if headers.get("x-broker-content-type") == Some(FORM_URLENCODED) {
        headers.insert("content-type", FORM_URLENCODED);
        if let Some(raw) = body.as_deref() {
            match json_to_form(raw) {
                Some(form) => body = Some(form),
                None => warn!("Body is not a JSON object, sending it as is"),
            }
        }
    }

    let mut prepared = PreparedRequest {
        url,
        method: payload.method.clone(),
        headers,
        body,
        timeout_ms: None,
    };
    recompute_content_length(&mut prepared);
    debug!("Prepared request {} {}", prepared.method, prepared.url);
    Ok(prepared)
}

/// Run pre-request hooks, then make `content-length` match the final body
pub async fn apply_hooks(
    prepared: PreparedRequest,
    config: &EffectiveConfig,
    plugins: &PluginRegistry,
) -> Result<PreparedRequest, PrepareError> {
    let mut prepared = plugins.run_pre_request(config, prepared).await?;
    recompute_content_length(&mut prepared);
    Ok(prepared)
}

/// Set `content-length` to the body's byte length, or drop it when there is no body
pub fn recompute_content_length(prepared: &mut PreparedRequest) {
    match &prepared.body {
        Some(body) => prepared
            .headers
            .insert("content-length", body.len().to_string()),
        None => {
            prepared.headers.remove("content-length");
        }
    }
}
