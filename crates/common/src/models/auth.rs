use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::AUTH_RENEW_MARGIN_SECS;

/// Time-limited credential held by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub access_token: String,

    /// Lifetime of `access_token` in seconds
    pub expires_in: u64,

    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl AuthState {
    pub fn new(access_token: impl Into<String>, expires_in: u64) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
            token_type: default_token_type(),
        }
    }

    /// Value of the `authorization` header
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Delay before renewal: the override if set, otherwise `expires_in` minus a safety margin
    pub fn renew_after(&self, override_ms: Option<u64>) -> Duration {
        match override_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.expires_in.saturating_sub(AUTH_RENEW_MARGIN_SECS)),
        }
    }
}
