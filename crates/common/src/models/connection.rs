use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a socket within its connection pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata a client sends when answering the identify challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Per-process client id, shared by both members of every pair
    pub client_id: String,

    /// Client version string, compared against the server minimums
    pub version: String,

    pub role: Role,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Loaded accept rules, reported back by the connection-status endpoint
    #[serde(default)]
    pub filters: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_integration_type: Option<String>,

    /// OAuth client id the client authenticated with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_app_client_id: Option<String>,
}

impl ClientMetadata {
    pub fn new(client_id: impl Into<String>, version: impl Into<String>, role: Role) -> Self {
        Self {
            client_id: client_id.into(),
            version: version.into(),
            role,
            capabilities: Vec::new(),
            filters: serde_json::Value::Null,
            server_id: None,
            supported_integration_type: None,
            broker_app_client_id: None,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Primary).unwrap(), r#""primary""#);
        let role: Role = serde_json::from_str(r#""secondary""#).unwrap();
        assert_eq!(role, Role::Secondary);
        assert_eq!(Role::Secondary.to_string(), "secondary");
    }

    #[test]
    fn test_metadata_defaults() {
        let json = r#"{"client_id":"c1","version":"4.190.0","role":"primary"}"#;
        let metadata: ClientMetadata = serde_json::from_str(json).unwrap();

        assert_eq!(metadata.client_id, "c1");
        assert!(metadata.capabilities.is_empty());
        assert!(metadata.filters.is_null());
        assert!(metadata.server_id.is_none());
        assert!(!metadata.has_capability("post-streams"));
    }

    #[test]
    fn test_metadata_capabilities() {
        let mut metadata = ClientMetadata::new("c1", "4.190.0", Role::Primary);
        metadata.capabilities.push("post-streams".to_string());
        assert!(metadata.has_capability("post-streams"));
    }
}
