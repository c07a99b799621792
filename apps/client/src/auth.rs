//! OAuth client credentials and periodic connection renewal

use broker_common::{AuthState, BrokerError, Result, Role, constants::AUTH_RENEW_MARGIN_SECS};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OAuthCredentials;
use crate::context::BrokerContext;

/// Exchange client credentials for an access token
pub async fn fetch_access_token(
    http: &reqwest::Client,
    api_base_url: &str,
    credentials: &OAuthCredentials,
) -> Result<AuthState> {
    let form = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("grant_type", "client_credentials")
        .append_pair("client_id", &credentials.client_id)
        .append_pair("client_secret", &credentials.client_secret)
        .finish();

    let resp = http
        .post(format!("{}/oauth2/token", api_base_url))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(form)
        .send()
        .await
        .map_err(|e| BrokerError::HttpError(format!("Failed to fetch access token: {}", e)))?;

    let status = resp.status().as_u16();
    if status != 200 {
        error!("Unable to retrieve access token, status {}", status);
        return Err(BrokerError::CredentialInvalid(status));
    }

    resp.json::<AuthState>()
        .await
        .map_err(|e| BrokerError::HttpError(format!("Invalid token response: {}", e)))
}

/// Keep the shared access token fresh for the lifetime of the process
pub fn spawn_token_refresh(ctx: Arc<BrokerContext>) -> Option<JoinHandle<()>> {
    let credentials = ctx.config.oauth.clone()?;
    Some(tokio::spawn(async move {
        loop {
            let delay = match ctx.auth().await {
                Some(state) => state.renew_after(ctx.config.auth_expiration_override),
                None => Duration::ZERO,
            };
            tokio::time::sleep(delay).await;

            match fetch_access_token(&ctx.http, &ctx.config.api_base_url, &credentials).await {
                Ok(state) => {
                    debug!("Access token refreshed, expires in {}s", state.expires_in);
                    ctx.set_auth(state).await;
                }
                Err(e) => {
                    warn!("Failed to refresh access token: {}", e);
                    tokio::time::sleep(Duration::from_secs(AUTH_RENEW_MARGIN_SECS)).await;
                }
            }
        }
    }))
}

/// Result of one renewal call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// Definite client error; the credential will not become valid again
    Rejected(u16),
    Failed(String),
}

/// Tell the API this socket is still alive with the current credential
pub async fn renew_connection(
    ctx: &BrokerContext,
    identifier: &str,
    role: Role,
    server_id: Option<&str>,
) -> RenewOutcome {
    let url = format!(
        "{}/hidden/brokers/connections/{}/auth/refresh",
        ctx.config.api_base_url, identifier
    );
    let body = json!({
        "data": {
            "type": "broker_connection",
            "attributes": { "broker_client_id": ctx.client_id },
        }
    });

    let mut req = ctx
        .http
        .post(url)
        .query(&[
            ("server_id", server_id.unwrap_or_default()),
            ("connection_role", role.as_str()),
        ])
        .header("content-type", "application/vnd.api+json")
        .body(body.to_string());
    if let Some(auth) = ctx.auth_header().await {
        req = req.header("authorization", auth);
    }

    match req.send().await {
        Ok(resp) if resp.status().is_success() => RenewOutcome::Renewed,
        Ok(resp) if resp.status().is_client_error() => {
            RenewOutcome::Rejected(resp.status().as_u16())
        }
        Ok(resp) => RenewOutcome::Failed(format!("status {}", resp.status())),
        Err(e) => RenewOutcome::Failed(e.to_string()),
    }
}

/// Renew a socket's connection on a timer while OAuth is in use
///
/// A rejected renewal exits the process with code 1 and stops the timer.
pub async fn spawn_renewal(
    ctx: Arc<BrokerContext>,
    identifier: String,
    role: Role,
    server_id: Option<String>,
) -> Option<JoinHandle<()>> {
    let interval = ctx
        .auth()
        .await?
        .renew_after(ctx.config.auth_expiration_override);

    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match renew_connection(&ctx, &identifier, role, server_id.as_deref()).await {
                RenewOutcome::Renewed => {
                    debug!("Renewed {} connection", role);
                }
                RenewOutcome::Rejected(status) => {
                    error!(
                        status,
                        "Failed to renew connection due to a client error. Exiting..."
                    );
                    ctx.exit.exit(1);
                    return;
                }
                RenewOutcome::Failed(e) => {
                    warn!("Failed to renew {} connection, retrying later: {}", role, e);
                }
            }
        }
    }))
}

/// Fetch the first access token when client credentials are configured
pub async fn initial_auth(ctx: &BrokerContext) -> Result<()> {
    let Some(credentials) = &ctx.config.oauth else {
        return Ok(());
    };
    let state = fetch_access_token(&ctx.http, &ctx.config.api_base_url, credentials).await?;
    info!("Obtained access token, expires in {}s", state.expires_in);
    ctx.set_auth(state).await;
    Ok(())
}
