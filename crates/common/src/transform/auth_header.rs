use base64::{Engine as _, engine::general_purpose::STANDARD};

use super::vars::{PoolIndex, replace};
use crate::config::EffectiveConfig;
use crate::filter::AuthSpec;

/// Render a rule's auth template into an `authorization` header value
pub fn auth_header(spec: &AuthSpec, config: &EffectiveConfig, pools: &PoolIndex) -> String {
    match spec {
        AuthSpec::Token { token } => format!("Token {}", replace(token, config, pools)),
        AuthSpec::Bearer { token } => format!("Bearer {}", replace(token, config, pools)),
        AuthSpec::Basic {
            username,
            password,
            token,
        } => {
            let raw = match token.as_deref().filter(|t| !t.is_empty()) {
                Some(token) => replace(token, config, pools),
                None => format!(
                    "{}:{}",
                    replace(username.as_deref().unwrap_or_default(), config, pools),
                    replace(password.as_deref().unwrap_or_default(), config, pools)
                ),
            };
            format!("Basic {}", STANDARD.encode(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EffectiveConfig {
        let mut config = EffectiveConfig::default();
        config.insert("USER", "alice");
        config.insert("PASS", "s3cret");
        config.insert("TOKEN", "tkn");
        config
    }

    #[test]
    fn test_token_and_bearer() {
        let pools = PoolIndex::new();
        let token = AuthSpec::Token {
            token: "${TOKEN}".to_string(),
        };
        let bearer = AuthSpec::Bearer {
            token: "${TOKEN}".to_string(),
        };
        assert_eq!(auth_header(&token, &config(), &pools), "Token tkn");
        assert_eq!(auth_header(&bearer, &config(), &pools), "Bearer tkn");
    }

    #[test]
    fn test_basic_user_pass() {
        let spec = AuthSpec::Basic {
            username: Some("${USER}".to_string()),
            password: Some("${PASS}".to_string()),
            token: None,
        };
        assert_eq!(
            auth_header(&spec, &config(), &PoolIndex::new()),
            format!("Basic {}", STANDARD.encode("alice:s3cret"))
        );
    }

    #[test]
    fn test_basic_token_form() {
        let spec = AuthSpec::Basic {
            username: None,
            password: None,
            token: Some("${TOKEN}".to_string()),
        };
        assert_eq!(
            auth_header(&spec, &config(), &PoolIndex::new()),
            format!("Basic {}", STANDARD.encode("tkn"))
        );
    }
}
