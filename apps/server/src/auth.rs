//! JWT authentication for tunnel upgrades and stream posts
//!
//! Only enforced when mandatory auth is enabled. The `azp` claim names the broker app
//! client a stream post must belong to.

use axum::http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

/// JWT Claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
    /// Authorized party: the broker app client id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No authentication token provided")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Authentication is not configured")]
    NotConfigured,
}

/// Bearer token from the authorization header, scheme matched case-insensitively
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return None;
    }
    Some(token.trim().to_string())
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(token_data.claims)
}

/// Authenticate a request when mandatory auth is on
///
/// Returns `Ok(None)` when authentication is not required.
pub fn authenticate(config: &Config, headers: &HeaderMap) -> Result<Option<Claims>, AuthError> {
    if !config.mandatory_auth {
        return Ok(None);
    }
    let secret = config.jwt_secret.as_deref().ok_or(AuthError::NotConfigured)?;
    let token = extract_token(headers).ok_or(AuthError::MissingToken)?;

    match validate_token(&token, secret) {
        Ok(claims) => {
            debug!("Token validated for {}", claims.sub);
            Ok(Some(claims))
        }
        Err(e) => {
            warn!("Token validation failed: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) fn test_token(secret: &str, azp: Option<&str>, valid_for: i64) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let now = chrono::Utc::now();
    let claims = Claims {
        sub: "broker-client".to_string(),
        exp: (now + chrono::Duration::seconds(valid_for)).timestamp() as usize,
        iat: Some(now.timestamp() as usize),
        azp: azp.map(str::to_string),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
