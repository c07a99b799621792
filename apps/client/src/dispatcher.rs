//! Server allocation for HA deployments

use broker_common::{constants::DISPATCHER_API_VERSION, hash_token};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::DispatcherConfig;

#[derive(Debug, Deserialize)]
struct AllocationResponse {
    data: AllocationData,
}

#[derive(Debug, Deserialize)]
struct AllocationData {
    attributes: AllocationAttributes,
}

#[derive(Debug, Deserialize)]
struct AllocationAttributes {
    server_id: String,
}

/// Ask the dispatcher which server this token should be pinned to
///
/// Any failure yields `None`; the connection proceeds without a server id.
pub async fn get_server_id(
    http: &reqwest::Client,
    dispatcher: &DispatcherConfig,
    token: &str,
    client_id: &str,
    authorization: Option<&str>,
) -> Option<String> {
    let url = format!(
        "{}/hidden/broker/{}/connections/{}",
        dispatcher.base_url,
        hash_token(token),
        client_id
    );
    let body = json!({
        "data": {
            "attributes": {
                "deployment_location": dispatcher.deployment_location,
                "broker_token_first_char": token.chars().next().map(String::from).unwrap_or_default(),
            }
        }
    });

    let mut req = http
        .post(&url)
        .query(&[("version", DISPATCHER_API_VERSION)])
        .header("content-type", "application/vnd.api+json")
        .body(body.to_string());
    if let Some(auth) = authorization {
        req = req.header("authorization", auth);
    }

    let result = match req.send().await {
        Ok(resp) if resp.status().is_success() => resp
            .json::<AllocationResponse>()
            .await
            .map(|r| r.data.attributes.server_id)
            .map_err(|e| e.to_string()),
        Ok(resp) => Err(format!("status {}", resp.status())),
        Err(e) => Err(e.to_string()),
    };

    match result {
        Ok(server_id) => {
            debug!("Dispatcher allocated server {}", server_id);
            Some(server_id)
        }
        Err(e) => {
            warn!("Could not receive server id from Broker Dispatcher: {}", e);
            None
        }
    }
}
