//! Executing requests that arrive over the tunnel

use broker_common::{
    Message, RequestPayload, ResponsePayload,
    transform::{PreparedRequest, apply_hooks, interpolate, prepare},
    validation::strip_context_prefix,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::connection::TunnelHandle;
use crate::context::BrokerContext;
use crate::response::{StreamedResponse, post_stream, send_chunks};

/// How the response to a tunnel request travels back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Responder {
    /// A single `response` message correlated by request id
    Buffered { id: String },
    /// A framed HTTP POST to the server's response-data endpoint
    Post {
        streaming_id: String,
        request_id: Option<String>,
    },
    /// Legacy `chunk` messages over the socket
    Chunks { streaming_id: String },
}

impl Responder {
    pub async fn for_request(handle: &TunnelHandle, id: &str, payload: &RequestPayload) -> Self {
        match &payload.streaming_id {
            None => Responder::Buffered { id: id.to_string() },
            Some(streaming_id) if handle.server_accepts_post_streams().await => Responder::Post {
                streaming_id: streaming_id.clone(),
                request_id: payload.request_id().map(str::to_string),
            },
            Some(streaming_id) => Responder::Chunks {
                streaming_id: streaming_id.clone(),
            },
        }
    }

    /// Execute the prepared request and relay its response
    pub async fn relay(&self, ctx: &BrokerContext, handle: &TunnelHandle, prepared: PreparedRequest) {
        match self {
            Responder::Buffered { .. } => {
                let payload = ctx.downstream.request_buffered(&prepared).await;
                self.respond(ctx, handle, payload).await;
            }
            _ => {
                let response = StreamedResponse::fetch(ctx, &prepared).await;
                self.stream(ctx, handle, response).await;
            }
        }
    }

    /// Send a locally produced response, e.g. a block or an error
    pub async fn respond(&self, ctx: &BrokerContext, handle: &TunnelHandle, payload: ResponsePayload) {
        match self {
            Responder::Buffered { id } => {
                let message = Message::Response {
                    id: id.clone(),
                    payload,
                };
                if let Err(e) = handle.send(&message).await {
                    error!("Failed to send response {}: {}", id, e);
                }
            }
            _ => {
                self.stream(ctx, handle, StreamedResponse::from_payload(&payload))
                    .await
            }
        }
    }

    async fn stream(&self, ctx: &BrokerContext, handle: &TunnelHandle, response: StreamedResponse) {
        let result = match self {
            Responder::Post {
                streaming_id,
                request_id,
            } => post_stream(ctx, handle, streaming_id, request_id.as_deref(), response).await,
            Responder::Chunks { streaming_id } => send_chunks(handle, streaming_id, response).await,
            Responder::Buffered { .. } => return,
        };
        if let Err(e) = result {
            error!("Failed to stream response: {}", e);
        }
    }
}

/// Run a tunnel request through the inbound filter and transformer, then execute it
pub async fn handle_tunnel_request(
    ctx: Arc<BrokerContext>,
    handle: TunnelHandle,
    id: String,
    mut payload: RequestPayload,
) {
    let responder = Responder::for_request(&handle, &id, &payload).await;
    match prepare_tunnel_request(&ctx, &handle, &mut payload).await {
        Ok(prepared) => responder.relay(&ctx, &handle, prepared).await,
        Err(response) => responder.respond(&ctx, &handle, response).await,
    }
}

/// Filter and transform a tunnel request; failures come back as the response to send
pub async fn prepare_tunnel_request(
    ctx: &BrokerContext,
    handle: &TunnelHandle,
    payload: &mut RequestPayload,
) -> Result<PreparedRequest, ResponsePayload> {
    let (prefix_context, url) = strip_context_prefix(&payload.url);
    payload.url = url;
    let context_id = prefix_context.or_else(|| payload.context_id().map(str::to_string));
    let request_id = payload.ensure_request_id();

    let identifier = payload
        .connection_identifier
        .clone()
        .unwrap_or_else(|| handle.identifier().to_string());
    let config = ctx
        .resolve(&identifier, context_id.as_deref())
        .await
        .map_err(|e| ResponsePayload::json(e.status_code(), &json!({ "message": e.to_string() })))?;

    let connection_type = config.connection_type();
    let rule = match ctx.filters_for(connection_type.as_deref()).await {
        Some(set) => set.inbound.matches(payload),
        None => None,
    };
    let Some(rule) = rule else {
        warn!(
            "Request does not match any accept rule, blocking websocket request: {} {}",
            payload.method, payload.url
        );
        return Err(blocked(&payload.url));
    };
    debug!("Request {} matched rule {} {}", request_id, rule.method, rule.path);

    let interpolated = interpolate(&rule, payload, &config, &ctx.pools, true);
    let prepared = prepare(interpolated, payload, &ctx.prepare_options())
        .map_err(|e| ResponsePayload::json(e.status, &json!({ "message": e.message })))?;
    apply_hooks(prepared, &config, &ctx.plugins)
        .await
        .map_err(|e| ResponsePayload::json(e.status, &json!({ "message": e.message })))
}

fn blocked(url: &str) -> ResponsePayload {
    ResponsePayload::json(
        401,
        &json!({
            "message": "blocked",
            "reason": "Request does not match any accept rule, blocking websocket request",
            "url": url,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use broker_common::{
        Role, Rule, RuleFile, RuleSet,
        constants::{BROKER_VERSION, CAPABILITY_RECEIVE_POST_STREAMS},
    };
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rules(origin: &str) -> RuleFile {
        RuleFile::Classic(RuleSet {
            public: vec![],
            private: vec![Rule::new("get", "/repos/:owner/:repo", origin)],
        })
    }

    async fn open_handle() -> (TunnelHandle, mpsc::Receiver<WsMessage>) {
        let handle = TunnelHandle::new("tok", Role::Primary);
        let (tx, rx) = mpsc::channel(16);
        handle.attach(tx).await;
        (handle, rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<WsMessage>) -> Message {
        match rx.recv().await {
            Some(WsMessage::Text(text)) => Message::from_json(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmatched_request_is_blocked() {
        let (ctx, _) = test_context("http://127.0.0.1:9", None, Some(rules("https://x")));
        let (handle, mut rx) = open_handle().await;

        let payload = RequestPayload::new("POST", "/repos/a/b");
        handle_tunnel_request(ctx, handle, "r1".to_string(), payload).await;

        match next_message(&mut rx).await {
            Message::Response { id, payload } => {
                assert_eq!(id, "r1");
                assert_eq!(payload.status, 401);
                let body: serde_json::Value =
                    serde_json::from_slice(&payload.body_bytes().unwrap()).unwrap();
                assert_eq!(body["message"], "blocked");
                assert_eq!(body["url"], "/repos/a/b");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_matched_request_is_executed() {
        let downstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b"))
            .and(header(
                "user-agent",
                format!("Snyk Broker Client {}", BROKER_VERSION),
            ))
            .and(header(
                "x-broker-origin-ua",
                format!("Snyk Broker {}", BROKER_VERSION),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string("repo"))
            .expect(1)
            .mount(&downstream)
            .await;

        let (ctx, _) = test_context("http://127.0.0.1:9", None, Some(rules(&downstream.uri())));
        let (handle, mut rx) = open_handle().await;

        let payload = RequestPayload::new("GET", "/repos/a/b");
        handle_tunnel_request(ctx, handle, "r2".to_string(), payload).await;

        match next_message(&mut rx).await {
            Message::Response { payload, .. } => {
                assert_eq!(payload.status, 200);
                assert_eq!(payload.body_bytes().unwrap(), b"repo");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_context_is_configuration_error() {
        let (ctx, _) = test_context("http://127.0.0.1:9", None, Some(rules("https://x")));
        let (handle, _rx) = open_handle().await;

        let mut payload = RequestPayload::new(
            "GET",
            "/ctx/3f1c9b6e-7a6e-4f7e-9a55-2c1d2b3a4f5e/repos/a/b",
        );
        let err = prepare_tunnel_request(&ctx, &handle, &mut payload)
            .await
            .unwrap_err();
        assert_eq!(payload.url, "/repos/a/b");
        assert_eq!(err.status, 500);
    }

    #[tokio::test]
    async fn test_streaming_request_without_post_support_uses_chunks() {
        let downstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data"))
            .mount(&downstream)
            .await;

        let (ctx, _) = test_context("http://127.0.0.1:9", None, Some(rules(&downstream.uri())));
        let (handle, mut rx) = open_handle().await;

        let mut payload = RequestPayload::new("GET", "/repos/a/b");
        payload.streaming_id = Some("s1".to_string());
        handle_tunnel_request(ctx, handle, "r3".to_string(), payload).await;

        match next_message(&mut rx).await {
            Message::Chunk {
                streaming_id, head, ..
            } => {
                assert_eq!(streaming_id, "s1");
                assert_eq!(head.unwrap().status, 200);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_responder_selection() {
        let (handle, _rx) = open_handle().await;
        let mut payload = RequestPayload::new("GET", "/").with_header("snyk-request-id", "abc");
        assert_eq!(
            Responder::for_request(&handle, "r", &payload).await,
            Responder::Buffered { id: "r".to_string() }
        );

        payload.streaming_id = Some("s".to_string());
        assert!(matches!(
            Responder::for_request(&handle, "r", &payload).await,
            Responder::Chunks { .. }
        ));

        handle
            .set_server_capabilities(vec![CAPABILITY_RECEIVE_POST_STREAMS.to_string()])
            .await;
        assert_eq!(
            Responder::for_request(&handle, "r", &payload).await,
            Responder::Post {
                streaming_id: "s".to_string(),
                request_id: Some("abc".to_string()),
            }
        );
    }
}
