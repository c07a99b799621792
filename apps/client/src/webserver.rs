//! Local webserver: healthcheck and relay of local callers to the server

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use broker_common::{
    constants::{BROKER_VERSION, TUNNEL_RESPONSE_TIMEOUT_SECS},
    http::{into_http_response, request_payload},
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

use crate::connection::PairHandles;
use crate::context::BrokerContext;

/// Largest request body a local caller may send
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

pub fn router(ctx: Arc<BrokerContext>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .fallback(relay)
        .with_state(ctx)
}

async fn healthcheck(State(ctx): State<Arc<BrokerContext>>) -> Response {
    let pairs: Vec<PairHandles> = ctx.tunnels.iter().map(|e| e.value().clone()).collect();

    let mut all_open = !pairs.is_empty();
    let mut connections = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let primary = pair.primary.state().await;
        let secondary = pair.secondary.state().await;
        let open = pair.open_handle().await.is_some();
        all_open &= open;
        connections.push(json!({
            "name": pair.name,
            "ok": open,
            "primary": primary.name(),
            "secondary": secondary.name(),
        }));
    }

    let status = if all_open {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = json!({
        "ok": all_open,
        "version": BROKER_VERSION,
        "brokerServerUrl": ctx.config.server_url,
        "connections": connections,
    });
    (status, Json(body)).into_response()
}

/// Why a local request could not be assigned to a connection
#[derive(Debug, PartialEq, Eq)]
enum Unroutable {
    UnknownType,
    UnexpectedWebhook,
}

/// Pick the pair a local request travels over
///
/// Classic mode has a single pair. Universal mode routes `/webhook/{type}/...` to the
/// pair whose integration type matches, with the github and bitbucket aliases.
fn select_pair(
    universal: bool,
    path: &str,
    pairs: &[PairHandles],
) -> Result<Option<PairHandles>, Unroutable> {
    if !universal {
        return Ok(pairs.first().cloned());
    }

    let Some(rest) = path.strip_prefix("/webhook/") else {
        return Err(Unroutable::UnknownType);
    };
    let requested = rest.split('/').next().unwrap_or_default();
    let has = |ty: &str| pairs.iter().any(|p| p.integration_type.as_deref() == Some(ty));

    let resolved = if has(requested) {
        requested
    } else if requested == "github" {
        ["github-enterprise", "github-server-app", "github-cloud-app"]
            .into_iter()
            .find(|alias| has(alias))
            .ok_or(Unroutable::UnexpectedWebhook)?
    } else if requested == "bitbucket-server" && has("bitbucket-server-bearer-auth") {
        "bitbucket-server-bearer-auth"
    } else {
        return Err(Unroutable::UnexpectedWebhook);
    };

    Ok(pairs
        .iter()
        .find(|p| p.integration_type.as_deref() == Some(resolved))
        .cloned())
}

async fn relay(State(ctx): State<Arc<BrokerContext>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return message(StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large");
        }
    };
    let mut payload = request_payload(&parts.method, &parts.uri, &parts.headers, &body);

    let pairs: Vec<PairHandles> = ctx.tunnels.iter().map(|e| e.value().clone()).collect();
    let pair = match select_pair(ctx.config.is_universal(), parts.uri.path(), &pairs) {
        Ok(Some(pair)) => pair,
        Ok(None) => return message(StatusCode::BAD_GATEWAY, "No open tunnel connection"),
        Err(Unroutable::UnknownType) => {
            error!("Unknown type in client->server request: {}", parts.uri.path());
            return text(
                StatusCode::UNAUTHORIZED,
                "Unknown request type, unable to forward to server.",
            );
        }
        Err(Unroutable::UnexpectedWebhook) => {
            warn!("Unexpected type in webhook request: {}", parts.uri.path());
            return text(
                StatusCode::UNAUTHORIZED,
                "Unexpected type in webhook request, unable to forward to server.",
            );
        }
    };

    let Some(handle) = pair.open_handle().await else {
        return message(StatusCode::BAD_GATEWAY, "No open tunnel connection");
    };

    let connection_type = match ctx.resolve(handle.identifier(), None).await {
        Ok(config) => config.connection_type(),
        Err(e) => {
            error!("Failed to resolve connection {}: {}", pair.name, e);
            return message(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };
    let rule = match ctx.filters_for(connection_type.as_deref()).await {
        Some(set) => set.outbound.matches(&payload),
        None => None,
    };
    if rule.is_none() {
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

    payload.ensure_request_id();
    debug!("Relaying {} {} over {}", payload.method, payload.url, pair.name);
    match handle
        .request(payload, Duration::from_secs(TUNNEL_RESPONSE_TIMEOUT_SECS))
        .await
    {
        Ok(response) => into_http_response(&response).map(Body::from).into_response(),
        Err(e) => {
            error!("Relay over {} failed: {}", pair.name, e);
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            message(status, &e.to_string())
        }
    }
}

fn message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

fn text(status: StatusCode, body: &'static str) -> Response {
    (status, Body::from(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TunnelHandle;
    use crate::context::{test_context, test_context_with};
    use axum::http::Request;
    use broker_common::{Message, ResponsePayload, Role, Rule, RuleFile, RuleSet};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    fn pair(name: &str, integration_type: Option<&str>) -> PairHandles {
        PairHandles::new(
            name,
            integration_type.map(str::to_string),
            TunnelHandle::new("tok", Role::Primary),
            TunnelHandle::new("tok", Role::Secondary),
        )
    }

    fn outbound_rules() -> RuleFile {
        RuleFile::Classic(RuleSet {
            public: vec![Rule::new("post", "/webhook/github/*", "")],
            private: vec![],
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_select_pair_classic_uses_first() {
        let pairs = vec![pair("default", None)];
        let selected = select_pair(false, "/anything", &pairs).unwrap().unwrap();
        assert_eq!(selected.name, "default");
    }

    #[test]
    fn test_select_pair_universal_webhooks() {
        let pairs = vec![
            pair("gh", Some("github-enterprise")),
            pair("bb", Some("bitbucket-server-bearer-auth")),
        ];

        let selected = select_pair(true, "/webhook/github/abc", &pairs).unwrap().unwrap();
        assert_eq!(selected.name, "gh");

        let selected = select_pair(true, "/webhook/bitbucket-server/x", &pairs)
            .unwrap()
            .unwrap();
        assert_eq!(selected.name, "bb");

        assert_eq!(
            select_pair(true, "/webhook/gitlab/x", &pairs).unwrap_err(),
            Unroutable::UnexpectedWebhook
        );
        assert_eq!(
            select_pair(true, "/api/other", &pairs).unwrap_err(),
            Unroutable::UnknownType
        );
    }

    #[tokio::test]
    async fn test_healthcheck_reports_connection_states() {
        let (ctx, _) = test_context("http://127.0.0.1:9", None, None);
        let closed = pair("default", None);
        ctx.tunnels.insert("default".to_string(), closed);

        let response = router(ctx.clone())
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["connections"][0]["primary"], "pending");

        let (tx, _rx) = mpsc::channel(1);
        let primary = ctx.tunnels.get("default").unwrap().primary.clone();
        primary.attach(tx).await;
        let response = router(ctx)
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unmatched_outbound_request_is_blocked() {
        let (ctx, _) = test_context("http://127.0.0.1:9", None, Some(outbound_rules()));
        let open = pair("default", None);
        let (tx, _rx) = mpsc::channel(1);
        open.primary.attach(tx).await;
        ctx.tunnels.insert("default".to_string(), open);

        let response = router(ctx)
            .oneshot(Request::get("/not/allowed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["message"], "blocked");
        assert_eq!(body["url"], "/not/allowed");
    }

    #[tokio::test]
    async fn test_matched_request_is_relayed_over_tunnel() {
        let (ctx, _) = test_context("http://127.0.0.1:9", None, Some(outbound_rules()));
        let open = pair("default", None);
        let (tx, mut rx) = mpsc::channel(4);
        open.primary.attach(tx).await;
        ctx.tunnels.insert("default".to_string(), open.clone());

        let responder = open.primary.clone();
        tokio::spawn(async move {
            let Some(WsMessage::Text(text)) = rx.recv().await else {
                panic!("expected request frame");
            };
            let Message::Request { id, payload } = Message::from_json(&text).unwrap() else {
                panic!("expected request message");
            };
            assert_eq!(payload.url, "/webhook/github/hook");
            assert_eq!(payload.body.as_deref(), Some("{\"a\":1}"));
            assert!(payload.request_id().is_some());
            responder.pending().complete(
                &id,
                ResponsePayload::json(202, &serde_json::json!({"accepted": true})),
            );
        });

        let request = Request::post("/webhook/github/hook")
            .header("content-type", "application/json")
            .body(Body::from("{\"a\":1}"))
            .unwrap();
        let response = router(ctx).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["accepted"], true);
    }

    #[tokio::test]
    async fn test_universal_unknown_path_is_rejected() {
        let (ctx, _) = test_context_with("http://127.0.0.1:9", None, None, |config| {
            config.connections_file = Some("/dev/null".into())
        });
        let response = router(ctx)
            .oneshot(Request::get("/random").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
