use anyhow::{Context, Result};
use broker_common::{
    AuthState, BrokerConfig, CompiledFilterSet, DownstreamClient, EffectiveConfig, Filters,
    PluginRegistry, PoolIndex, RuleFile,
    filter::FilterError,
    transform::PrepareOptions,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::PairHandles;
use crate::shutdown::ProcessExit;

/// Everything a client task needs, shared as `Arc<BrokerContext>`
pub struct BrokerContext {
    pub config: Config,

    /// Per-process id shared by every socket this client opens
    pub client_id: String,

    broker_config: RwLock<BrokerConfig>,
    filters: RwLock<Filters>,
    rules: RwLock<Value>,
    auth: RwLock<Option<AuthState>>,

    pub plugins: PluginRegistry,
    pub pools: PoolIndex,
    pub downstream: DownstreamClient,

    /// Client for calls to the server, dispatcher and API
    pub http: reqwest::Client,

    /// Live pairs by connection name
    pub tunnels: DashMap<String, PairHandles>,

    /// Wakes the synchronizer for an immediate pass
    pub sync_requested: Notify,

    pub exit: Arc<dyn ProcessExit>,
}

impl BrokerContext {
    pub fn new(
        config: Config,
        broker_config: BrokerConfig,
        plugins: PluginRegistry,
        exit: Arc<dyn ProcessExit>,
    ) -> Result<Self> {
        let (filters, rules) = match &config.accept {
            Some(path) => {
                let (filters, file) = Filters::load(path)
                    .with_context(|| format!("Failed to load accept rules from {}", path.display()))?;
                (filters, rules_value(&file))
            }
            None => {
                warn!("No accept rules configured, every request will be blocked");
                (Filters::default(), Value::Null)
            }
        };

        let downstream = DownstreamClient::new()
            .context("Failed to build downstream client")?
            .with_insecure_downstream(config.insecure_downstream);
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build http client")?;

        Ok(Self {
            config,
            client_id: broker_common::utils::generate_client_id(),
            broker_config: RwLock::new(broker_config),
            filters: RwLock::new(filters),
            rules: RwLock::new(rules),
            auth: RwLock::new(None),
            plugins,
            pools: PoolIndex::new(),
            downstream,
            http,
            tunnels: DashMap::new(),
            sync_requested: Notify::new(),
            exit,
        })
    }

    pub async fn broker_config(&self) -> BrokerConfig {
        self.broker_config.read().await.clone()
    }

    /// Re-read the connections file; the previous config stays on failure
    pub async fn reload_broker_config(&self) {
        if !self.config.is_universal() {
            return;
        }
        match self.config.load_broker_config(std::env::vars()) {
            Ok(config) => *self.broker_config.write().await = config,
            Err(e) => warn!("Failed to reload configuration, keeping the previous one: {}", e),
        }
    }

    /// Filter set for a connection type
    pub async fn filters_for(&self, connection_type: Option<&str>) -> Option<CompiledFilterSet> {
        self.filters.read().await.for_type(connection_type).cloned()
    }

    /// Rules as reported in the identify metadata
    pub async fn rules(&self) -> Value {
        self.rules.read().await.clone()
    }

    /// Reload the accept file
    pub async fn reload_filters(&self) -> std::result::Result<(), FilterError> {
        let Some(path) = &self.config.accept else {
            return Ok(());
        };
        let (filters, file) = Filters::load(path)?;
        *self.filters.write().await = filters;
        *self.rules.write().await = rules_value(&file);
        info!("Filters reloaded from {}", path.display());
        Ok(())
    }

    pub async fn auth(&self) -> Option<AuthState> {
        self.auth.read().await.clone()
    }

    pub async fn set_auth(&self, state: AuthState) {
        *self.auth.write().await = Some(state);
    }

    /// `authorization` header value for server calls, when OAuth is in use
    pub async fn auth_header(&self) -> Option<String> {
        self.auth.read().await.as_ref().map(AuthState::header_value)
    }

    pub fn broker_app_client_id(&self) -> Option<String> {
        self.config.oauth.as_ref().map(|o| o.client_id.clone())
    }

    /// Effective configuration for a tunnel identifier and optional context
    pub async fn resolve(
        &self,
        identifier: &str,
        context_id: Option<&str>,
    ) -> broker_common::Result<EffectiveConfig> {
        let store = self.plugins.store();
        self.broker_config
            .read()
            .await
            .resolve_for_identifier(identifier, context_id, &|name| store.get(name))
    }

    pub fn prepare_options(&self) -> PrepareOptions {
        PrepareOptions {
            remove_x_forwarded_headers: self.config.remove_x_forwarded_headers,
            ..Default::default()
        }
    }
}

fn rules_value(file: &RuleFile) -> Value {
    serde_json::to_value(file).unwrap_or(Value::Null)
}

#[cfg(test)]
pub(crate) fn test_context(
    server_url: &str,
    broker_config: Option<BrokerConfig>,
    rules: Option<RuleFile>,
) -> (Arc<BrokerContext>, Arc<crate::shutdown::testing::RecordingExit>) {
    test_context_with(server_url, broker_config, rules, |_| {})
}

#[cfg(test)]
pub(crate) fn test_context_with(
    server_url: &str,
    broker_config: Option<BrokerConfig>,
    rules: Option<RuleFile>,
    tweak: impl FnOnce(&mut Config),
) -> (Arc<BrokerContext>, Arc<crate::shutdown::testing::RecordingExit>) {
    test_context_with_plugins(server_url, broker_config, rules, PluginRegistry::new(), tweak)
}

#[cfg(test)]
pub(crate) fn test_context_with_plugins(
    server_url: &str,
    broker_config: Option<BrokerConfig>,
    rules: Option<RuleFile>,
    plugins: PluginRegistry,
    tweak: impl FnOnce(&mut Config),
) -> (Arc<BrokerContext>, Arc<crate::shutdown::testing::RecordingExit>) {
    use crate::config::{Args, classic_broker_config};
    use clap::Parser;

    let mut config = Config::from_args(
        Args::try_parse_from(["broker-client", "--server-url", server_url]).unwrap(),
    );
    tweak(&mut config);
    let exit = Arc::new(crate::shutdown::testing::RecordingExit::default());
    let ctx = BrokerContext::new(
        config,
        broker_config.unwrap_or_else(|| classic_broker_config(Some("tok"))),
        plugins,
        exit.clone(),
    )
    .unwrap();

    if let Some(file) = rules {
        *ctx.filters.try_write().unwrap() = Filters::compile(&file);
        *ctx.rules.try_write().unwrap() = rules_value(&file);
    }
    (Arc::new(ctx), exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_common::{Rule, RuleSet};
    use std::io::Write;

    #[tokio::test]
    async fn test_resolve_classic_connection() {
        let (ctx, _) = test_context("http://127.0.0.1:9", None, None);
        let config = ctx.resolve("tok", None).await.unwrap();
        assert_eq!(config.get_str("identifier").as_deref(), Some("tok"));
        assert!(ctx.resolve("other", None).await.is_err());
    }

    #[tokio::test]
    async fn test_filters_from_rules() {
        let rules = RuleFile::Classic(RuleSet {
            public: vec![],
            private: vec![Rule::new("get", "/x", "https://example.com")],
        });
        let (ctx, _) = test_context("http://127.0.0.1:9", None, Some(rules));
        let set = ctx.filters_for(None).await.unwrap();
        assert_eq!(set.inbound.len(), 1);
        assert!(ctx.rules().await["private"].is_array());
    }

    #[tokio::test]
    async fn test_reload_filters_from_accept_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"private":[{{"method":"get","path":"/a","origin":"https://a"}}]}}"#)
            .unwrap();
        file.flush().unwrap();

        let accept = file.path().to_path_buf();
        let (ctx, _) = test_context_with("http://127.0.0.1:9", None, None, |config| {
            config.accept = Some(accept.clone())
        });
        assert_eq!(ctx.filters_for(None).await.unwrap().inbound.len(), 1);

        std::fs::write(
            &accept,
            r#"{"private":[{"method":"get","path":"/a","origin":"https://a"},{"method":"post","path":"/b","origin":"https://b"}]}"#,
        )
        .unwrap();
        ctx.reload_filters().await.unwrap();
        assert_eq!(ctx.filters_for(None).await.unwrap().inbound.len(), 2);
        assert_eq!(ctx.rules().await["private"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_header() {
        let (ctx, _) = test_context("http://127.0.0.1:9", None, None);
        assert!(ctx.auth_header().await.is_none());
        ctx.set_auth(AuthState::new("jwt", 3600)).await;
        assert_eq!(ctx.auth_header().await.as_deref(), Some("Bearer jwt"));
    }
}
