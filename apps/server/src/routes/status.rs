use axum::{
    Json,
    body::Bytes,
    extract::{Path, Request, State},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;

use super::{TokenPath, client_missing};
use crate::AppState;

/// `/connection-status/{token}`: versions and filters of the connected clients
pub async fn connection_status(
    State(state): State<Arc<AppState>>,
    Path(TokenPath { token }): Path<TokenPath>,
    request: Request,
) -> Response {
    let token = token.to_lowercase();
    let clients = state.pool.clients(&token);
    if clients.is_empty() {
        let (parts, _) = request.into_parts();
        return client_missing(&state, &parts.method, &parts.uri, &parts.headers, Bytes::new())
            .await;
    }

    let clients: Vec<_> = clients
        .iter()
        .map(|c| json!({ "version": c.metadata.version, "filters": c.metadata.filters }))
        .collect();
    Json(json!({ "ok": true, "clients": clients })).into_response()
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::Config;
    use crate::routes::{BROKER_FAILURE_HEADER, router};
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_connected_client_status() {
        let state = state();
        let _client = register(&state, "tok", "4.210.0", &[]);

        let response = router(state)
            .oneshot(Request::get("/connection-status/tok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["clients"][0]["version"], "4.210.0");
    }

    #[tokio::test]
    async fn test_unknown_token_status() {
        let response = router(state())
            .oneshot(Request::get("/connection-status/nobody").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[BROKER_FAILURE_HEADER], "no-connection");
    }

    #[tokio::test]
    async fn test_replica_does_not_forward_with_mandatory_auth_or_twice() {
        let config = Config {
            mandatory_auth: true,
            jwt_secret: Some("s".to_string()),
            ..Default::default()
        };
        let response = router(state_with(config))
            .oneshot(
                Request::get("/connection-status/tok")
                    .header("host", "broker-0-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router(state())
            .oneshot(
                Request::get("/connection-status/tok?connection_role=primary")
                    .header("host", "broker-0-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
