//! `/broker/{token}/...`: relay an HTTP request to the client owning the token

use axum::{
    Json,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use broker_common::{
    BrokerError, Message, RequestPayload,
    constants::CAPABILITY_POST_STREAMS,
    hash_token,
    http::{into_http_response, request_payload},
    mask_token,
    stream::StreamReceiver,
    utils::{generate_request_id, generate_streaming_id},
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{MAX_BODY_SIZE, TokenPath, client_missing, relayed_url};
use crate::{AppState, ClientSocket, error_handling::error_response};

pub async fn forward(
    State(state): State<Arc<AppState>>,
    Path(TokenPath { token }): Path<TokenPath>,
    request: Request,
) -> Response {
    let token = token.to_lowercase();
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "message": "Request entity too large" })),
            )
                .into_response();
        }
    };

    let Some(client) = state.pool.newest(&token) else {
        return client_missing(&state, &parts.method, &parts.uri, &parts.headers, body).await;
    };

    let mut payload = request_payload(&parts.method, &parts.uri, &parts.headers, &body);
    payload.url = relayed_url(&parts.uri, "broker", &token);
    payload.headers.remove("host");

    if !state.outbound_allowed(&client, &payload) {
        warn!(
            "Request does not match any accept rule, blocking HTTP request: {} {}",
            payload.method, payload.url
        );
        let body = json!({
            "message": "blocked",
            "reason": "Request does not match any accept rule, blocking HTTP request",
            "url": payload.url,
        });
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }

    let request_id = payload.ensure_request_id();
    info!(
        "Relaying {} {} to {} ({}) request {}",
        payload.method,
        payload.url,
        mask_token(&token),
        hash_token(&token),
        request_id
    );

    if client.metadata.has_capability(CAPABILITY_POST_STREAMS) {
        relay_streamed(&state, &client, payload).await
    } else {
        match client.request(payload, state.config.response_timeout).await {
            Ok(response) => into_http_response(&response).map(Body::from).into_response(),
            Err(e) => {
                warn!("Relay to {} failed: {}", mask_token(&token), e);
                error_response(&e)
            }
        }
    }
}

/// Relay a request whose response comes back through the stream store
async fn relay_streamed(state: &AppState, client: &ClientSocket, mut payload: RequestPayload) -> Response {
    let streaming_id = generate_streaming_id();
    payload.streaming_id = Some(streaming_id.clone());
    let receiver = state
        .streams
        .begin(&streaming_id, client.metadata.broker_app_client_id.clone());

    let message = Message::Request {
        id: generate_request_id(),
        payload,
    };
    if let Err(e) = client.send(&message).await {
        abort_stream(state, &streaming_id, e).await;
        return error_response(&BrokerError::ConnectionError("client socket closed".to_string()));
    }

    let StreamReceiver { head, body } = receiver;
    let head = match tokio::time::timeout(state.config.response_timeout, head).await {
        Ok(Ok(head)) => head,
        Ok(Err(_)) => {
            warn!(streaming_id = %streaming_id, "Stream closed before response head");
            return error_response(&BrokerError::StreamNotFound(streaming_id));
        }
        Err(_) => {
            let e = BrokerError::UpstreamTimeout { buffered_bytes: 0 };
            let response = error_response(&e);
            abort_stream(state, &streaming_id, e).await;
            return response;
        }
    };
    debug!(streaming_id = %streaming_id, "Streaming response with status {}", head.status);

    let mut response = Response::new(Body::from_stream(StreamReceiver::into_body_stream(body)));
    *response.status_mut() = StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in head.headers.iter() {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

async fn abort_stream(state: &AppState, streaming_id: &str, error: BrokerError) {
    if let Some(handler) = state.streams.handler(streaming_id) {
        handler.abort(error).await;
    }
}
