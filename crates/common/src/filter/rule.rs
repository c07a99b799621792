use serde::{Deserialize, Serialize};

/// Methods a rule declared with `any` is replicated into
pub const ANY_METHODS: [&str; 7] = ["get", "post", "put", "delete", "patch", "head", "options"];

/// A single accept rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// HTTP method or `any`; defaults to `get`
    #[serde(default = "default_method")]
    pub method: String,

    /// Path template, e.g. "/repos/:owner/:repo/contents/:path*"
    pub path: String,

    /// Destination origin template, e.g. "https://${GITHUB}"
    #[serde(default)]
    pub origin: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid: Vec<ValidEntry>,

    /// Set on match to the connection type whose filter accepted the request
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "connection_type")]
    pub connection_type: Option<String>,
}

fn default_method() -> String {
    "get".to_string()
}

impl Rule {
    pub fn new(method: &str, path: &str, origin: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            origin: origin.to_string(),
            auth: None,
            valid: Vec::new(),
            connection_type: None,
        }
    }

    pub fn with_valid(mut self, entry: ValidEntry) -> Self {
        self.valid.push(entry);
        self
    }

    pub fn with_auth(mut self, auth: AuthSpec) -> Self {
        self.auth = Some(auth);
        self
    }
}

/// Authentication injected into matched requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum AuthSpec {
    Token {
        token: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

/// A per-field validity predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidEntry {
    /// Header must be present with one of `values`
    Header { header: String, values: Vec<String> },

    /// Query parameter must equal (or glob-match) one of `values`
    QueryParam {
        #[serde(rename = "queryParam", alias = "query_param")]
        query_param: String,
        values: Vec<String>,
    },

    /// JSON body value at `path` must match `regex`
    BodyRegex { path: String, regex: String },

    /// JSON body value at `path` must equal `value`
    BodyValue {
        path: String,
        value: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_defaults() {
        let rule: Rule = serde_json::from_str(r#"{"path":"/x"}"#).unwrap();
        assert_eq!(rule.method, "get");
        assert!(rule.origin.is_empty());
        assert!(rule.valid.is_empty());
    }

    #[test]
    fn test_valid_entries_parse_by_shape() {
        let json = r#"[
            {"header": "accept", "values": ["application/vnd.github.v4.sha"]},
            {"queryParam": "ref", "values": ["main", "release/*"]},
            {"path": "commit.message", "regex": "^fix"},
            {"path": "type", "value": "push"}
        ]"#;
        let entries: Vec<ValidEntry> = serde_json::from_str(json).unwrap();

        assert!(matches!(entries[0], ValidEntry::Header { .. }));
        assert!(matches!(entries[1], ValidEntry::QueryParam { .. }));
        assert!(matches!(entries[2], ValidEntry::BodyRegex { .. }));
        assert_eq!(
            entries[3],
            ValidEntry::BodyValue {
                path: "type".to_string(),
                value: json!("push")
            }
        );
    }

    #[test]
    fn test_auth_spec_schemes() {
        let auth: AuthSpec =
            serde_json::from_str(r#"{"scheme":"token","token":"${GITHUB_TOKEN}"}"#).unwrap();
        assert_eq!(
            auth,
            AuthSpec::Token {
                token: "${GITHUB_TOKEN}".to_string()
            }
        );

        let auth: AuthSpec =
            serde_json::from_str(r#"{"scheme":"basic","username":"u","password":"p"}"#).unwrap();
        assert!(matches!(auth, AuthSpec::Basic { token: None, .. }));
    }

    #[test]
    fn test_rule_camel_case_fields() {
        let rule: Rule = serde_json::from_str(
            r#"{"method":"any","path":"/*","origin":"https://x","connectionType":"github"}"#,
        )
        .unwrap();
        assert_eq!(rule.connection_type.as_deref(), Some("github"));

        let out = serde_json::to_string(&rule).unwrap();
        assert!(out.contains(r#""connectionType":"github""#));
    }
}
