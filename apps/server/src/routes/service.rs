//! `/service/{token}/...`: out-of-band commands for a connected client

use axum::{
    Json,
    body::Body,
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use broker_common::{http::into_http_response, mask_token, validation::version_below};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::{MAX_BODY_SIZE, TokenPath, client_missing, relayed_url};
use crate::{AppState, error_handling::error_response};

pub async fn forward(
    State(state): State<Arc<AppState>>,
    Path(TokenPath { token }): Path<TokenPath>,
    request: Request,
) -> Response {
    let token = token.to_lowercase();
    let (parts, body) = request.into_parts();

    let Some(client) = state.pool.newest(&token) else {
        let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
            .await
            .unwrap_or_default();
        return client_missing(&state, &parts.method, &parts.uri, &parts.headers, body).await;
    };

    let version = &client.metadata.version;
    let minimum = &state.config.minimal_service_version;
    if version != "local" && version_below(version, minimum) {
        return (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({
                "ok": false,
                "msg": format!("Not implemented for client versions before {}", minimum),
            })),
        )
            .into_response();
    }

    let command = relayed_url(&parts.uri, "service", &token);
    info!("Sending service command {} to {}", command, mask_token(&token));
    match client.service(&command, state.config.response_timeout).await {
        Ok(response) => into_http_response(&response).map(Body::from).into_response(),
        Err(e) => {
            warn!("Service command {} failed: {}", command, e);
            error_response(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::routes::router;
    use axum::{body::Body, extract::ws::Message as WsMessage, http::Request, http::StatusCode};
    use broker_common::{Message, ResponsePayload};
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_old_client_is_not_implemented() {
        let state = state();
        let _client = register(&state, "tok", "4.200.0", &[]);

        let response = router(state)
            .oneshot(Request::post("/service/tok/filters/reload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let body = body_json(response).await;
        assert_eq!(body["msg"], "Not implemented for client versions before 4.209.0");
    }

    #[tokio::test]
    async fn test_service_command_is_relayed() {
        let state = state();
        let (client, mut rx) = register(&state, "tok", "local", &[]);

        tokio::spawn(async move {
            let Some(WsMessage::Text(text)) = rx.recv().await else {
                panic!("expected text frame");
            };
            let Message::Service { id, command } = Message::from_json(text.as_str()).unwrap() else {
                panic!("expected service message");
            };
            assert_eq!(command, "/filters/reload");
            client.pending().complete(
                &id,
                ResponsePayload::json(200, &json!({ "ok": true, "msg": "Filters reloaded." })),
            );
        });

        let response = router(state)
            .oneshot(
                Request::post("/service/tok/filters/reload?connection_role=primary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["msg"], "Filters reloaded.");
    }
}
