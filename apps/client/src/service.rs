//! Service commands the server sends over the tunnel

use broker_common::ResponsePayload;
use serde_json::json;
use tracing::{info, warn};

use crate::context::BrokerContext;

/// Execute a service command and build its reply
pub async fn handle_command(ctx: &BrokerContext, command: &str) -> ResponsePayload {
    let path = command.split('?').next().unwrap_or_default();
    info!("Received service command {}", path);

    match path {
        "/filters/reload" => match ctx.reload_filters().await {
            Ok(()) => reply(200, true, "Filters reloaded."),
            Err(e) => {
                warn!("Failed to reload filters: {}", e);
                reply(500, false, &format!("Failed to reload filters: {}", e))
            }
        },
        "/config/reload" => {
            ctx.sync_requested.notify_one();
            reply(200, true, "Synchronizing Config.")
        }
        _ => reply(400, false, "Unknown service command."),
    }
}

fn reply(status: u16, ok: bool, msg: &str) -> ResponsePayload {
    ResponsePayload::json(status, &json!({ "ok": ok, "msg": msg }))
}
