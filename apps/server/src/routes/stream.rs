//! `/response-data/{token}/{streaming_id}`: framed streamed responses posted by clients

use axum::{
    Json,
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use broker_common::mask_token;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::{AppState, auth, error_handling::client_message};

#[derive(Debug, Deserialize)]
pub struct StreamPath {
    token: String,
    streaming_id: String,
}

pub async fn response_data(
    State(state): State<Arc<AppState>>,
    Path(StreamPath {
        token,
        streaming_id,
    }): Path<StreamPath>,
    request: Request,
) -> Response {
    let request_id = request
        .headers()
        .get("snyk-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    info!(
        streaming_id = %streaming_id,
        request_id = %request_id,
        "Handling response-data request for {}",
        mask_token(&token)
    );

    let Some(handler) = state.streams.handler(&streaming_id) else {
        error!(streaming_id = %streaming_id, "Unable to find request matching streaming id");
        return message(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unable to find request matching streaming id",
        );
    };

    if state.config.mandatory_auth {
        let azp = auth::authenticate(&state.config, request.headers())
            .ok()
            .flatten()
            .and_then(|claims| claims.azp);
        if azp.is_none() || azp.as_deref() != handler.broker_app_client_id() {
            error!(
                streaming_id = %streaming_id,
                "Invalid Broker Client credentials for stream on response data"
            );
            return message(StatusCode::UNAUTHORIZED, "Invalid Broker Client credentials");
        }
    }

    let body = Box::pin(request.into_body().into_data_stream());
    match handler.consume(body).await {
        Ok(bytes) => {
            info!(streaming_id = %streaming_id, bytes, "Response data received");
            (StatusCode::OK, Json(json!({}))).into_response()
        }
        Err(e) => {
            error!(streaming_id = %streaming_id, "Received error handling POST from client: {}", e);
            message(StatusCode::INTERNAL_SERVER_ERROR, &client_message(&e))
        }
    }
}

fn message(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}
