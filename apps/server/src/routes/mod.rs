//! HTTP surface of the server

mod broker;
mod service;
mod status;
mod stream;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use broker_common::constants::BROKER_VERSION;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{AppState, error_handling::sanitize_error_with_message, socket};

/// Token segment shared by the relaying routes
#[derive(Debug, Deserialize)]
pub(crate) struct TokenPath {
    pub token: String,
}

/// Largest request body relayed to a client
pub(crate) const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Header explaining why the server could not serve a request
pub const BROKER_FAILURE_HEADER: &str = "x-broker-failure";

static REPLICA_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"-[0-9]{1,2}-[0-1]").unwrap());
static REPLICA_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"-[0-9]{1,2}\.").unwrap());

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/primus/{token}", get(socket::upgrade))
        .route("/primus/{token}/", get(socket::upgrade))
        .route("/connection-status/{token}", get(status::connection_status))
        .route("/broker/{token}", any(broker::forward))
        .route("/broker/{token}/", any(broker::forward))
        .route("/broker/{token}/{*path}", any(broker::forward))
        .route("/service/{token}/{*path}", any(service::forward))
        .route(
            "/response-data/{token}/{streaming_id}",
            post(stream::response_data),
        )
        .with_state(state)
}

async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "version": BROKER_VERSION }))
}

/// Hostname the request was addressed to, without port
fn request_hostname(headers: &HeaderMap) -> Option<&str> {
    let host = headers.get("host")?.to_str().ok()?;
    Some(host.rsplit_once(':').map_or(host, |(name, _)| name))
}

/// Host of the primary replica when this server is a secondary replica
pub(crate) fn primary_replica_host(hostname: &str) -> Option<String> {
    if !hostname.ends_with("-1") || !REPLICA_HOST.is_match(hostname) {
        return None;
    }
    Some(REPLICA_SUFFIX.replace(hostname, ".").into_owned())
}

/// Response for a token with no registered socket
///
/// A secondary replica forwards the request to its primary; otherwise 404.
pub(crate) async fn client_missing(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let already_forwarded = uri
        .query()
        .is_some_and(|q| q.split('&').any(|pair| pair == "connection_role=primary"));
    let primary = request_hostname(headers)
        .filter(|_| !state.config.mandatory_auth && !already_forwarded)
        .and_then(primary_replica_host);

    match primary {
        Some(host) => forward_to_primary(state, &host, method, uri, headers, body).await,
        None => {
            debug!("No client connection for {}", uri.path());
            let mut response = (StatusCode::NOT_FOUND, Json(json!({ "ok": false }))).into_response();
            response.headers_mut().insert(
                BROKER_FAILURE_HEADER,
                HeaderValue::from_static("no-connection"),
            );
            response
        }
    }
}

async fn forward_to_primary(
    state: &AppState,
    host: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let query = match uri.query() {
        Some(q) => format!("{}&connection_role=primary", q),
        None => "connection_role=primary".to_string(),
    };
    let url = format!("{}://{}{}?{}", scheme, host, uri.path(), query);
    debug!("Forwarding request to primary replica {}", url);

    let mut forwarded = headers.clone();
    forwarded.remove("host");
    forwarded.remove("content-length");
    let result = state
        .downstream
        .inner()
        .request(method.clone(), &url)
        .headers(forwarded)
        .body(body)
        .send()
        .await;

    let upstream = match result {
        Ok(upstream) => upstream,
        Err(e) => return primary_failure(anyhow::Error::new(e)),
    };
    let status = upstream.status();
    let mut upstream_headers = upstream.headers().clone();
    upstream_headers.remove("content-length");
    upstream_headers.remove("transfer-encoding");
    match upstream.bytes().await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = upstream_headers;
            response
        }
        Err(e) => primary_failure(anyhow::Error::new(e)),
    }
}

fn primary_failure(e: anyhow::Error) -> Response {
    warn!("Forwarding to primary replica failed");
    let message = sanitize_error_with_message(&e, "Error forwarding request to primary.");
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
    response.headers_mut().insert(
        BROKER_FAILURE_HEADER,
        HeaderValue::from_static("error-forwarding-to-primary"),
    );
    response
}

/// Path and query after the `/{prefix}/{token}` segment, without `connection_role`
pub(crate) fn relayed_url(uri: &Uri, prefix: &str, token: &str) -> String {
    let path = uri.path();
    let marker = format!("/{}/{}", prefix, token);
    let rest = match path.get(..marker.len()) {
        Some(head) if head.eq_ignore_ascii_case(&marker) => &path[marker.len()..],
        _ => path,
    };
    let rest = if rest.is_empty() { "/" } else { rest };

    let query: Vec<&str> = uri
        .query()
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty() && !pair.starts_with("connection_role="))
                .collect()
        })
        .unwrap_or_default();
    if query.is_empty() {
        rest.to_string()
    } else {
        format!("{}?{}", rest, query.join("&"))
    }
}
