//! Delivering streamed responses back to the server

use broker_common::{
    BrokerError, Message, ResponsePayload, Result, StreamHead,
    constants::{BROKER_VERSION, STREAM_CONTENT_TYPE, STREAM_POST_TIMEOUT_MS},
    http::unavailable_response,
    stream::encode_head,
    transform::PreparedRequest,
    utils::{Headers, encode_body},
};
use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::connection::TunnelHandle;
use crate::context::BrokerContext;

/// Status, headers and body of a response about to be relayed
pub struct StreamedResponse {
    pub head: StreamHead,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl StreamedResponse {
    pub fn from_payload(payload: &ResponsePayload) -> Self {
        let body = match payload.body_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!("Dropping undecodable response body: {}", e);
                Bytes::new()
            }
        };
        Self {
            head: StreamHead::new(payload.status, payload.headers.clone()),
            body: futures_util::stream::once(async move { Ok(body) }).boxed(),
        }
    }

    pub fn from_downstream(resp: reqwest::Response) -> Self {
        let head = StreamHead::new(resp.status().as_u16(), Headers::from_header_map(resp.headers()));
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| BrokerError::DownstreamUnavailable(e.to_string())))
            .boxed();
        Self { head, body }
    }

    /// Call the destination; a failure before headers becomes a 500 with a JSON body
    pub async fn fetch(ctx: &BrokerContext, prepared: &PreparedRequest) -> Self {
        match ctx.downstream.send(prepared).await {
            Ok(resp) => {
                if resp.status().as_u16() > 404 {
                    warn!("Downstream {} returned {}", prepared.url, resp.status());
                }
                Self::from_downstream(resp)
            }
            Err(e) => Self::from_payload(&unavailable_response(&e.to_string())),
        }
    }
}

/// POST a framed response to the server's response-data endpoint
pub async fn post_stream(
    ctx: &BrokerContext,
    handle: &TunnelHandle,
    streaming_id: &str,
    request_id: Option<&str>,
    response: StreamedResponse,
) -> Result<u64> {
    let url = format!(
        "{}/response-data/{}/{}",
        ctx.config.server_url,
        handle.identifier(),
        streaming_id
    );
    let status = response.head.status;
    let head = encode_head(&response.head)?;

    let sent = Arc::new(AtomicU64::new(0));
    let counter = sent.clone();
    let framed = futures_util::stream::once(async move { Ok(head) })
        .chain(response.body)
        .inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
        });

    let mut req = ctx
        .http
        .post(&url)
        .header("content-type", STREAM_CONTENT_TYPE)
        .header("x-broker-client-version", BROKER_VERSION)
        .timeout(Duration::from_millis(STREAM_POST_TIMEOUT_MS))
        .body(reqwest::Body::wrap_stream(framed));
    if let Some(request_id) = request_id {
        req = req.header("snyk-request-id", request_id);
    }
    if let Some(auth) = ctx.auth_header().await {
        req = req.header("authorization", auth);
    }

    match req.send().await {
        Ok(resp) if resp.status().is_success() => {
            let bytes = sent.load(Ordering::Relaxed);
            info!(streaming_id = %streaming_id, status, bytes, "Streamed response posted");
            Ok(bytes)
        }
        Ok(resp) => {
            warn!(
                streaming_id = %streaming_id,
                "Server rejected streamed response with {}",
                resp.status()
            );
            Err(BrokerError::HttpError(format!(
                "response-data returned {}",
                resp.status()
            )))
        }
        Err(e) if e.is_timeout() => {
            let bytes = sent.load(Ordering::Relaxed);
            error!(
                streaming_id = %streaming_id,
                "Streamed response POST timed out with {} bytes in flight", bytes
            );
            Err(BrokerError::UpstreamTimeout {
                buffered_bytes: bytes,
            })
        }
        Err(e) => {
            error!(streaming_id = %streaming_id, "Failed to post streamed response: {}", e);
            Err(BrokerError::ConnectionError(e.to_string()))
        }
    }
}

/// Send a response as legacy `chunk` messages over the socket
///
/// A body that fails mid-stream is reported with an error chunk instead of `finished`.
pub async fn send_chunks(
    handle: &TunnelHandle,
    streaming_id: &str,
    response: StreamedResponse,
) -> Result<u64> {
    let chunk = |data: String, finished: bool, head: Option<StreamHead>, error: Option<String>| {
        Message::Chunk {
            streaming_id: streaming_id.to_string(),
            data,
            finished,
            head,
            error,
        }
    };

    handle
        .send(&chunk(String::new(), false, Some(response.head), None))
        .await?;

    let mut body = response.body;
    let mut bytes = 0u64;
    while let Some(next) = body.next().await {
        match next {
            Ok(data) => {
                bytes += data.len() as u64;
                handle
                    .send(&chunk(encode_body(&data), false, None, None))
                    .await?;
            }
            Err(e) => {
                error!(streaming_id = %streaming_id, bytes, "Downstream body failed mid-stream: {}", e);
                handle
                    .send(&chunk(String::new(), false, None, Some(e.to_string())))
                    .await?;
                return Err(e);
            }
        }
    }

    handle.send(&chunk(String::new(), true, None, None)).await?;
    debug!(streaming_id = %streaming_id, bytes, "Chunked response sent");
    Ok(bytes)
}
