//! Executing requests clients send over their tunnel

use broker_common::{
    RequestPayload, ResponsePayload,
    transform::{PrepareOptions, interpolate, prepare},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::{AppState, ClientSocket};

/// Filter, transform and execute a client request against the server's own origins
pub async fn handle_client_request(
    state: &AppState,
    token: &str,
    client: &ClientSocket,
    mut payload: RequestPayload,
) -> ResponsePayload {
    let request_id = payload.ensure_request_id();

    let Some(rule) = state.inbound_rule(client, &payload) else {
        warn!(
            "Request does not match any accept rule, blocking websocket request: {} {}",
            payload.method, payload.url
        );
        return ResponsePayload::json(
            401,
            &json!({
                "message": "blocked",
                "reason": "Request does not match any accept rule, blocking websocket request",
                "url": payload.url,
            }),
        );
    };
    debug!("Request {} matched rule {} {}", request_id, rule.method, rule.path);

    let interpolated = interpolate(&rule, &mut payload, &state.env, &state.pools, true);
    let options = PrepareOptions {
        broker_token: Some(token.to_string()),
        ..Default::default()
    };
    match prepare(interpolated, &payload, &options) {
        Ok(prepared) => state.downstream.request_buffered(&prepared).await,
        Err(e) => ResponsePayload::json(e.status, &json!({ "message": e.message })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use broker_common::{ClientMetadata, Role};
    use std::io::Write;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> ClientSocket {
        let (tx, _rx) = mpsc::channel(1);
        ClientSocket::new(tx, ClientMetadata::new("c1", "4.210.0", Role::Primary))
    }

    fn state_with_accept(rules: serde_json::Value, env: Vec<(String, String)>) -> AppState {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", rules).unwrap();
        let config = Config {
            accept: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        AppState::new(config, env).unwrap()
    }

    #[tokio::test]
    async fn test_without_accept_file_client_requests_are_blocked() {
        let state = AppState::new(Config::default(), Vec::new()).unwrap();
        let response = handle_client_request(
            &state,
            "tok",
            &client(),
            RequestPayload::new("POST", "/webhook/github/1"),
        )
        .await;
        assert_eq!(response.status, 401);
    }

    #[tokio::test]
    async fn test_matched_request_reaches_origin_with_broker_token() {
        let api = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/github/1"))
            .and(header("x-broker-token", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("received"))
            .expect(1)
            .mount(&api)
            .await;

        let rules = json!({
            "private": [{ "method": "post", "path": "/webhook/github/*", "origin": "${API_ORIGIN}" }],
            "public": []
        });
        let state = state_with_accept(rules, vec![("API_ORIGIN".to_string(), api.uri())]);

        let payload = RequestPayload::new("POST", "/webhook/github/1").with_body("{}");
        let response = handle_client_request(&state, "tok", &client(), payload).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_bytes().unwrap(), b"received");
    }
}
