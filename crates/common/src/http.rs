//! Outbound HTTP to downstream systems with bounded retry

use bytes::Bytes;
use reqwest::{Client, Method};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::constants::{BROKER_VERSION, DOWNSTREAM_RETRIES, DOWNSTREAM_RETRY_DELAY_MS};
use crate::error::{BrokerError, Result};
use crate::protocol::{RequestPayload, ResponsePayload};
use crate::transform::PreparedRequest;
use crate::utils::Headers;

/// Error type recorded on responses for transport failures
pub const DOWNSTREAM_UNAVAILABLE: &str = "DOWNSTREAM_UNAVAILABLE";

#[derive(Debug, Clone)]
pub struct DownstreamClient {
    client: Client,
    retries: u32,
    retry_delay: Duration,
    insecure_downstream: bool,
}

impl DownstreamClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| BrokerError::HttpError(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            client,
            retries: DOWNSTREAM_RETRIES,
            retry_delay: Duration::from_millis(DOWNSTREAM_RETRY_DELAY_MS),
            insecure_downstream: false,
        })
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Send to `http://` even when the destination says `https://`
    pub fn with_insecure_downstream(mut self, insecure: bool) -> Self {
        self.insecure_downstream = insecure;
        self
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Send a prepared request, retrying transport-level failures
    pub async fn send(&self, req: &PreparedRequest) -> Result<reqwest::Response> {
        let method = Method::from_bytes(req.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| BrokerError::InvalidMessage(format!("invalid method {}", req.method)))?;

        let url = if self.insecure_downstream {
            req.url.replacen("https://", "http://", 1)
        } else {
            req.url.clone()
        };

        let mut headers = req.headers.clone();
        let origin_ua = headers
            .get("user-agent")
            .unwrap_or("not-provided")
            .to_string();
        headers.insert("x-broker-origin-ua", origin_ua);
        headers.insert("user-agent", format!("Snyk Broker Client {}", BROKER_VERSION));
        let header_map = headers.to_header_map();

        let mut attempt = 0;
        loop {
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .headers(header_map.clone());
            if let Some(body) = &req.body {
                builder = builder.body(body.clone());
            }
            if let Some(timeout) = req.timeout_ms {
                builder = builder.timeout(Duration::from_millis(timeout));
            }

            match builder.send().await {
                Ok(resp) => {
                    debug!("Downstream {} {} -> {}", method, url, resp.status());
                    return Ok(resp);
                }
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Request to {} failed, retrying after {:?} ({}/{}): {}",
                        url, self.retry_delay, attempt, self.retries, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        "Error making request to downstream, giving up after {} retries: {}",
                        self.retries, e
                    );
                    return Err(BrokerError::DownstreamUnavailable(e.to_string()));
                }
            }
        }
    }

    /// Send and buffer the whole response; failures become a 500 response
    pub async fn request_buffered(&self, req: &PreparedRequest) -> ResponsePayload {
        let resp = match self.send(req).await {
            Ok(resp) => resp,
            Err(e) => return unavailable_response(&e.to_string()),
        };

        let status = resp.status().as_u16();
        let headers = Headers::from_header_map(resp.headers());
        match resp.bytes().await {
            Ok(body) => {
                if status > 404 {
                    warn!("Downstream {} returned {}", req.url, status);
                }
                ResponsePayload::from_bytes(status, headers, &body)
            }
            Err(e) => {
                error!("Failed to read downstream response body: {}", e);
                unavailable_response(&e.to_string())
            }
        }
    }
}

/// 500 response describing a transport failure
pub fn unavailable_response(message: &str) -> ResponsePayload {
    ResponsePayload::json(
        500,
        &json!({"message": message, "error_type": DOWNSTREAM_UNAVAILABLE}),
    )
    .with_error_type(DOWNSTREAM_UNAVAILABLE)
}

/// Build a tunnel request from an incoming HTTP request
///
/// Empty bodies become `None`; other bodies are carried as UTF-8 text.
///
/// The tunnel request body is a JSON string, so only text bodies relay intact.
/// Invalid UTF-8 sequences in a binary upload are replaced with U+FFFD and a
/// warning is logged; the destination receives the altered bytes.
pub fn request_payload(
    method: &http::Method,
    uri: &http::Uri,
    headers: &http::HeaderMap,
    body: &[u8],
) -> RequestPayload {
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let body = (!body.is_empty()).then(|| match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(e) => {
            warn!(url = %url, error = %e, "request body is not UTF-8, invalid bytes are replaced");
            String::from_utf8_lossy(body).into_owned()
        }
    });
    RequestPayload {
        url,
        method: method.as_str().to_string(),
        headers: Headers::from_header_map(headers),
        body,
        ..Default::default()
    }
}

/// Turn a buffered tunnel response back into an HTTP response
///
/// `content-length` and `transfer-encoding` are dropped so the server framing applies.
pub fn into_http_response(payload: &ResponsePayload) -> http::Response<Bytes> {
    let body = payload.body_bytes().unwrap_or_else(|e| {
        warn!("Dropping undecodable response body: {}", e);
        Vec::new()
    });

    let mut headers = payload.headers.clone();
    headers.remove("content-length");
    headers.remove("transfer-encoding");

    let mut response = http::Response::new(Bytes::from(body));
    *response.status_mut() =
        http::StatusCode::from_u16(payload.status).unwrap_or(http::StatusCode::BAD_GATEWAY);
    *response.headers_mut() = headers.to_header_map();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String) -> PreparedRequest {
        let mut headers = Headers::new();
        headers.insert("user-agent", "curl/8");
        PreparedRequest {
            url,
            method: "post".to_string(),
            headers,
            body: Some("ping".to_string()),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_buffered_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/echo"))
            .and(header("x-broker-origin-ua", "curl/8"))
            .and(header(
                "user-agent",
                format!("Snyk Broker Client {}", BROKER_VERSION),
            ))
            .and(body_string("ping"))
            .respond_with(ResponseTemplate::new(201).set_body_string("pong"))
            .expect(1)
            .mount(&server)
            .await;

        let client = DownstreamClient::new().unwrap();
        let resp = client
            .request_buffered(&request(format!("{}/api/echo", server.uri())))
            .await;

        assert_eq!(resp.status, 201);
        assert_eq!(resp.body_bytes().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_500() {
        let client = DownstreamClient::new()
            .unwrap()
            .with_retries(2, Duration::from_millis(5));

        // nothing listens on port 9 of localhost
        let resp = client
            .request_buffered(&request("http://127.0.0.1:9/x".to_string()))
            .await;

        assert_eq!(resp.status, 500);
        assert_eq!(resp.error_type.as_deref(), Some(DOWNSTREAM_UNAVAILABLE));
        let body: serde_json::Value = serde_json::from_slice(&resp.body_bytes().unwrap()).unwrap();
        assert_eq!(body["error_type"], DOWNSTREAM_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_error_status_is_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = DownstreamClient::new().unwrap();
        let resp = client.request_buffered(&request(server.uri())).await;
        assert_eq!(resp.status, 503);
        assert!(resp.error_type.is_none());
    }

    #[test]
    fn test_request_payload_from_http_parts() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-custom", http::HeaderValue::from_static("1"));
        let uri: http::Uri = "/repos/a?ref=main".parse().unwrap();

        let payload = request_payload(&http::Method::POST, &uri, &headers, b"");
        assert_eq!(payload.url, "/repos/a?ref=main");
        assert_eq!(payload.method, "POST");
        assert_eq!(payload.headers.get("x-custom"), Some("1"));
        assert!(payload.body.is_none());
    }

    #[test]
    fn test_request_payload_binary_body_is_replaced_lossily() {
        let uri: http::Uri = "/upload".parse().unwrap();
        let headers = http::HeaderMap::new();

        let payload = request_payload(&http::Method::PUT, &uri, &headers, "héllo".as_bytes());
        assert_eq!(payload.body.as_deref(), Some("héllo"));

        let payload = request_payload(&http::Method::PUT, &uri, &headers, &[b'a', 0xff, b'b']);
        assert_eq!(payload.body.as_deref(), Some("a\u{FFFD}b"));
    }

    #[test]
    fn test_into_http_response_drops_framing_headers() {
        let mut headers = Headers::new();
        headers.insert("content-length", "999");
        headers.insert("x-upstream", "yes");
        let payload = ResponsePayload::from_bytes(404, headers, b"missing");

        let response = into_http_response(&payload);
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert_eq!(response.body().as_ref(), b"missing");
    }
}
