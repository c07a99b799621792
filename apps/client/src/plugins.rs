//! Startup plugins shipped with the client

use async_trait::async_trait;
use broker_common::{
    BrokerConfig, BrokerPlugin, EffectiveConfig, PluginError, PluginRegistry,
    plugins::PluginStore, transform::PreparedRequest, utils::encode_body,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::CLASSIC_CONNECTION;
use crate::scm;

const REGISTRY_TYPES: [&str; 12] = [
    "docker-hub",
    "ecr",
    "acr",
    "gcr",
    "artifactory-cr",
    "harbor-cr",
    "quay-cr",
    "github-cr",
    "nexus-cr",
    "digitalocean-cr",
    "gitlab-cr",
    "google-artifact-cr",
];

/// Formats container registry credentials into `CR_CREDENTIALS` for the registry agent
pub struct ContainerRegistryCredentials;

impl ContainerRegistryCredentials {
    const CODE: &'static str = "CONTAINER_REGISTRY_CREDENTIALS_FORMAT_PLUGIN";

    fn missing(ty: &str, params: &str) -> PluginError {
        PluginError::Failed(format!(
            "Plugin {} startup failure: {} requires the following parameters: {}.",
            Self::CODE,
            ty,
            params
        ))
    }

    fn credentials(config: &EffectiveConfig) -> Result<Value, PluginError> {
        let ty = config.connection_type().unwrap_or_default();
        if !REGISTRY_TYPES.contains(&ty.as_str()) {
            return Err(PluginError::Failed(format!(
                "Plugin {} startup failure: unknown container registry type: {}.",
                Self::CODE,
                if ty.is_empty() { "<not provided>" } else { &ty }
            )));
        }

        let value = |key: &str| config.get_str(key).filter(|v| !v.is_empty());
        let credentials = match ty.as_str() {
            "ecr" => {
                let (Some(role_arn), Some(region), Some(external_id)) = (
                    value("CR_ROLE_ARN"),
                    value("CR_REGION"),
                    value("CR_EXTERNAL_ID"),
                ) else {
                    return Err(Self::missing(&ty, "CR_ROLE_ARN, CR_REGION and CR_EXTERNAL_ID"));
                };
                json!({
                    "type": ty,
                    "roleArn": role_arn,
                    "extra": { "region": region, "externalId": external_id },
                })
            }
            "digitalocean-cr" => {
                let Some(token) = value("CR_TOKEN") else {
                    return Err(Self::missing(&ty, "CR_TOKEN"));
                };
                json!({
                    "type": ty,
                    "username": token,
                    "password": token,
                    "registryBase": value("CR_BASE"),
                })
            }
            _ => {
                let (Some(username), Some(password)) = (value("CR_USERNAME"), value("CR_PASSWORD"))
                else {
                    return Err(Self::missing(&ty, "CR_USERNAME,CR_PASSWORD"));
                };
                json!({
                    "type": ty,
                    "username": username,
                    "password": password,
                    "registryBase": value("CR_BASE"),
                })
            }
        };
        Ok(credentials)
    }
}

#[async_trait]
impl BrokerPlugin for ContainerRegistryCredentials {
    fn plugin_code(&self) -> &str {
        Self::CODE
    }

    fn plugin_name(&self) -> &str {
        "Container Registry Credentials Formatting Plugin"
    }

    fn applicable_broker_types(&self) -> Vec<String> {
        REGISTRY_TYPES.iter().map(|t| t.to_string()).collect()
    }

    async fn start_up(
        &self,
        connection: &str,
        config: &EffectiveConfig,
        store: &PluginStore,
    ) -> Result<(), PluginError> {
        let credentials = Self::credentials(config)?;
        let encoded = encode_body(format!("{}\n", credentials).as_bytes());
        debug!("Formatted registry credentials for {}", connection);

        if config.get("BROKER_CLIENT_VALIDATION_URL").is_some() {
            store.set(connection, "BROKER_CLIENT_VALIDATION_URL", encoded.clone());
        }
        store.set(connection, "CR_CREDENTIALS", encoded);
        store.set(connection, "craCompatible", true);
        Ok(())
    }
}

/// Connection types served by the GitHub git-data plugins
fn github_types() -> Vec<String> {
    [
        CLASSIC_CONNECTION,
        "github",
        "github-enterprise",
        "github-server-app",
        "github-cloud-app",
    ]
    .iter()
    .map(|t| t.to_string())
    .collect()
}

/// Blocks create-tree requests that would add symlinks to a repository
pub struct GitHubTreeSymlinkCheck;

#[async_trait]
impl BrokerPlugin for GitHubTreeSymlinkCheck {
    fn plugin_code(&self) -> &str {
        "GITHUB_TREE_SYMLINK_CHECK"
    }

    fn plugin_name(&self) -> &str {
        "GitHub Tree Symlink Check Plugin"
    }

    fn applicable_broker_types(&self) -> Vec<String> {
        github_types()
    }

    async fn start_up(
        &self,
        _connection: &str,
        _config: &EffectiveConfig,
        _store: &PluginStore,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn pre_request(
        &self,
        _config: &EffectiveConfig,
        request: PreparedRequest,
    ) -> Result<PreparedRequest, PluginError> {
        if !scm::is_create_tree(&request.method, &request.url) {
            return Ok(request);
        }
        if let Err(e) = scm::validate_tree(request.body.as_deref().unwrap_or_default()) {
            error!("Error while checking github tree payload for symlinks: {}", e);
            return Err(PluginError::Blocking {
                status: 401,
                message: e.to_string(),
            });
        }
        Ok(request)
    }
}

/// Signs create-commit requests with the configured GPG key
///
/// Needs `GPG_PRIVATE_KEY`, `GPG_PASSPHRASE`, `GIT_COMMITTER_NAME` and `GIT_COMMITTER_EMAIL`.
pub struct GitHubCommitSigning;

impl GitHubCommitSigning {
    fn settings(config: &EffectiveConfig) -> Option<[String; 4]> {
        let value = |key: &str| config.get_str(key).filter(|v| !v.is_empty());
        Some([
            value("GPG_PRIVATE_KEY")?,
            value("GPG_PASSPHRASE")?,
            value("GIT_COMMITTER_NAME")?,
            value("GIT_COMMITTER_EMAIL")?,
        ])
    }
}

#[async_trait]
impl BrokerPlugin for GitHubCommitSigning {
    fn plugin_code(&self) -> &str {
        "GITHUB_COMMIT_SIGNING"
    }

    fn plugin_name(&self) -> &str {
        "GitHub Commit Signing Plugin"
    }

    fn applicable_broker_types(&self) -> Vec<String> {
        github_types()
    }

    async fn start_up(
        &self,
        _connection: &str,
        _config: &EffectiveConfig,
        _store: &PluginStore,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn pre_request(
        &self,
        config: &EffectiveConfig,
        mut request: PreparedRequest,
    ) -> Result<PreparedRequest, PluginError> {
        if !scm::is_create_commit(&request.method, &request.url) {
            return Ok(request);
        }
        let Some([key, passphrase, name, email]) = Self::settings(config) else {
            return Ok(request);
        };

        let body = request.body.as_deref().unwrap_or_default();
        let signed = scm::sign_commit(body, &name, &email, &key, &passphrase)
            .map_err(|e| PluginError::Failed(format!("error while signing github commit: {:#}", e)))?;
        info!("Signed github commit for {}", request.url);
        request.body = Some(signed);
        Ok(request)
    }
}

/// Registry with every built-in plugin that applies to the configured connection types
pub fn default_registry(config: &BrokerConfig) -> Result<PluginRegistry, PluginError> {
    let mut supported: Vec<String> = config
        .connections
        .values()
        .map(|c| c.connection_type.clone())
        .collect();
    supported.sort();
    supported.dedup();

    let global = EffectiveConfig::new(config.global.clone());
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(ContainerRegistryCredentials), &supported, &global)?;
    registry.register(Arc::new(GitHubTreeSymlinkCheck), &supported, &global)?;
    registry.register(Arc::new(GitHubCommitSigning), &supported, &global)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_common::{ConnectionConfig, utils::decode_body};
    use serde_json::Map;

    fn effective(values: Value) -> EffectiveConfig {
        match values {
            Value::Object(map) => EffectiveConfig::new(map),
            _ => EffectiveConfig::new(Map::new()),
        }
    }

    #[tokio::test]
    async fn test_docker_hub_credentials_are_stored() {
        let store = PluginStore::new();
        let config = effective(json!({
            "type": "docker-hub",
            "CR_USERNAME": "user",
            "CR_PASSWORD": "pass",
        }));

        ContainerRegistryCredentials
            .start_up("hub", &config, &store)
            .await
            .unwrap();

        let encoded = store.get_value("hub", "CR_CREDENTIALS").unwrap();
        let decoded = decode_body(encoded.as_str().unwrap()).unwrap();
        let credentials: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(credentials["username"], "user");
        assert_eq!(credentials["type"], "docker-hub");
        assert_eq!(store.get_value("hub", "craCompatible"), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_ecr_requires_role_parameters() {
        let store = PluginStore::new();
        let config = effective(json!({ "type": "ecr", "CR_ROLE_ARN": "arn" }));

        let err = ContainerRegistryCredentials
            .start_up("ecr", &config, &store)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CR_REGION"));
        assert!(store.get("ecr").is_none());
    }

    #[test]
    fn test_default_registry_only_loads_applicable_types() {
        let mut config = BrokerConfig::default();
        config
            .connections
            .insert("gh".to_string(), ConnectionConfig::new("github", Some("a")));
        let registry = default_registry(&config).unwrap();
        assert_eq!(registry.for_type("github").len(), 2);
        assert!(registry.for_type("docker-hub").is_empty());

        config
            .connections
            .insert("hub".to_string(), ConnectionConfig::new("docker-hub", Some("b")));
        let registry = default_registry(&config).unwrap();
        assert_eq!(registry.for_type("docker-hub").len(), 1);
    }

    fn github_config() -> EffectiveConfig {
        effective(json!({ "type": "github" }))
    }

    fn request(method: &str, url: &str, body: &str) -> PreparedRequest {
        PreparedRequest {
            url: url.to_string(),
            method: method.to_string(),
            body: Some(body.to_string()),
            ..Default::default()
        }
    }

    fn github_registry() -> PluginRegistry {
        let mut config = BrokerConfig::default();
        config
            .connections
            .insert("gh".to_string(), ConnectionConfig::new("github", Some("a")));
        default_registry(&config).unwrap()
    }

    #[tokio::test]
    async fn test_tree_with_symlink_blocks_request() {
        let body = r#"{"tree":[{"path":"evil","mode":"120000","type":"blob"}]}"#;
        let err = github_registry()
            .run_pre_request(
                &github_config(),
                request("POST", "https://api.github.com/repos/o/r/git/trees", body),
            )
            .await
            .unwrap_err();
        match err {
            PluginError::Blocking { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("evil"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_regular_tree_passes() {
        let body = r#"{"tree":[{"path":"a.txt","mode":"100644","type":"blob"}]}"#;
        let prepared = github_registry()
            .run_pre_request(
                &github_config(),
                request("POST", "https://api.github.com/repos/o/r/git/trees", body),
            )
            .await
            .unwrap();
        assert_eq!(prepared.body.as_deref(), Some(body));
    }

    #[tokio::test]
    async fn test_commit_signing_failure_is_skipped() {
        let body = r#"{"message":"m","tree":"t","parents":["p"],"author":{"name":"a","email":"a@x","date":"2024-01-01T00:00:00Z"}}"#;
        let config = effective(json!({
            "type": "github",
            "GPG_PRIVATE_KEY": "not a key",
            "GPG_PASSPHRASE": "pass",
            "GIT_COMMITTER_NAME": "Broker",
            "GIT_COMMITTER_EMAIL": "broker@example.com",
        }));
        let commits = "https://api.github.com/repos/o/r/git/commits";

        let err = GitHubCommitSigning
            .pre_request(&config, request("POST", commits, body))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Failed(_)));

        let prepared = github_registry()
            .run_pre_request(&config, request("POST", commits, body))
            .await
            .unwrap();
        assert_eq!(prepared.body.as_deref(), Some(body));
    }

    #[tokio::test]
    async fn test_commit_signing_needs_configuration() {
        let body = r#"{"message":"m"}"#;
        let prepared = GitHubCommitSigning
            .pre_request(
                &github_config(),
                request("POST", "https://api.github.com/repos/o/r/git/commits", body),
            )
            .await
            .unwrap();
        assert_eq!(prepared.body.as_deref(), Some(body));
    }
}
