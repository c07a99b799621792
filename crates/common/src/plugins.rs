//! Broker plugins: startup hooks and pre-request rewriting per connection type

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::EffectiveConfig;
use crate::transform::PreparedRequest;

#[derive(Debug, Error)]
pub enum PluginError {
    /// Validation failure that must stop the request with the given status
    #[error("{message}")]
    Blocking { status: u16, message: String },

    #[error("Plugin {0} has an identical name or code to a registered plugin")]
    Duplicate(String),

    #[error("Plugin failed: {0}")]
    Failed(String),
}

/// Runtime values written by plugins, keyed by connection name
///
/// These survive config reloads and win over every other config source.
#[derive(Debug, Default)]
pub struct PluginStore {
    entries: DashMap<String, Map<String, Value>>,
}

impl PluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, connection: &str) -> Option<Map<String, Value>> {
        self.entries.get(connection).map(|e| e.value().clone())
    }

    pub fn get_value(&self, connection: &str, key: &str) -> Option<Value> {
        self.entries
            .get(connection)
            .and_then(|e| e.value().get(key).cloned())
    }

    pub fn set(&self, connection: &str, key: &str, value: impl Into<Value>) {
        self.entries
            .entry(connection.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn remove(&self, connection: &str) {
        self.entries.remove(connection);
    }
}

#[async_trait]
pub trait BrokerPlugin: Send + Sync {
    fn plugin_code(&self) -> &str;

    fn plugin_name(&self) -> &str;

    /// Connection types this plugin applies to
    fn applicable_broker_types(&self) -> Vec<String>;

    fn is_active(&self) -> bool {
        true
    }

    fn is_disabled(&self, config: &EffectiveConfig) -> bool {
        config.is_truthy(&format!("DISABLE_{}_PLUGIN", self.plugin_code()))
    }

    /// Called when a connection is created or its credential changes
    async fn start_up(
        &self,
        connection: &str,
        config: &EffectiveConfig,
        store: &PluginStore,
    ) -> Result<(), PluginError>;

    /// Called for every context of a connection after `start_up`
    async fn start_up_context(
        &self,
        _connection: &str,
        _context_id: &str,
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
        Ok(request)
    }
}

/// Plugins grouped by the connection type they apply to, in registration order
#[derive(Default)]
pub struct PluginRegistry {
    by_type: HashMap<String, Vec<Arc<dyn BrokerPlugin>>>,
    store: PluginStore,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: HashMap<&str, Vec<&str>> = self
            .by_type
            .iter()
            .map(|(ty, plugins)| (ty.as_str(), plugins.iter().map(|p| p.plugin_name()).collect()))
            .collect();
        f.debug_struct("PluginRegistry").field("by_type", &types).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin for the supported types it applies to
    ///
    /// Inactive or disabled plugins are skipped. Two plugins sharing a name or code
    /// for the same type are rejected.
    pub fn register(
        &mut self,
        plugin: Arc<dyn BrokerPlugin>,
        supported_types: &[String],
        global: &EffectiveConfig,
    ) -> Result<(), PluginError> {
        if plugin.is_disabled(global) || !plugin.is_active() {
            info!("Skipping plugin {}, not active", plugin.plugin_name());
            return Ok(());
        }

        for ty in plugin
            .applicable_broker_types()
            .into_iter()
            .filter(|ty| supported_types.contains(ty))
        {
            let plugins = self.by_type.entry(ty).or_default();
            if plugins.iter().any(|p| {
                p.plugin_code() == plugin.plugin_code() || p.plugin_name() == plugin.plugin_name()
            }) {
                error!("Some plugins have identical name or code");
                return Err(PluginError::Duplicate(plugin.plugin_name().to_string()));
            }
            debug!("Loading plugin {}", plugin.plugin_name());
            plugins.push(plugin.clone());
        }
        Ok(())
    }

    pub fn for_type(&self, connection_type: &str) -> &[Arc<dyn BrokerPlugin>] {
        self.by_type
            .get(connection_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    /// Run startup hooks of a connection, then context hooks for each context id
    ///
    /// A failing hook is logged and does not stop the remaining ones.
    pub async fn run_start_up(
        &self,
        connection: &str,
        config: &EffectiveConfig,
        context_ids: &[String],
    ) {
        let Some(ty) = config.connection_type() else {
            return;
        };

        for plugin in self.for_type(&ty) {
            if let Err(e) = plugin.start_up(connection, config, &self.store).await {
                error!("Plugin {} failed to start for {}: {}", plugin.plugin_name(), connection, e);
            }
            for context_id in context_ids {
                if let Err(e) = plugin
                    .start_up_context(connection, context_id, config, &self.store)
                    .await
                {
                    error!(
                        "Plugin {} failed to start context {} for {}: {}",
                        plugin.plugin_name(),
                        context_id,
                        connection,
                        e
                    );
                }
            }
        }
    }

    /// Run pre-request hooks in registration order
    ///
    /// Failed hooks are skipped; a blocking error aborts with its status.
    pub async fn run_pre_request(
        &self,
        config: &EffectiveConfig,
        request: PreparedRequest,
    ) -> Result<PreparedRequest, PluginError> {
        let Some(ty) = config.connection_type() else {
            return Ok(request);
        };

        let mut request = request;
        for plugin in self.for_type(&ty) {
            match plugin.pre_request(config, request.clone()).await {
                Ok(updated) => request = updated,
                Err(e @ PluginError::Blocking { .. }) => {
                    warn!("Plugin {} blocked the request: {}", plugin.plugin_name(), e);
                    return Err(e);
                }
                Err(e) => warn!("Plugin {} pre-request failed, skipping: {}", plugin.plugin_name(), e),
            }
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HeaderPlugin {
        code: &'static str,
        name: &'static str,
        outcome: fn() -> Result<(), PluginError>,
    }

    #[async_trait]
    impl BrokerPlugin for HeaderPlugin {
        fn plugin_code(&self) -> &str {
            self.code
        }

        fn plugin_name(&self) -> &str {
            self.name
        }

        fn applicable_broker_types(&self) -> Vec<String> {
            vec!["github".to_string(), "jira".to_string()]
        }

        async fn start_up(
            &self,
            connection: &str,
            _config: &EffectiveConfig,
            store: &PluginStore,
        ) -> Result<(), PluginError> {
            store.set(connection, "MINTED_BY", self.name);
            Ok(())
        }

        async fn start_up_context(
            &self,
            connection: &str,
            context_id: &str,
            _config: &EffectiveConfig,
            store: &PluginStore,
        ) -> Result<(), PluginError> {
            store.set(connection, &format!("CTX_{}", context_id), true);
            Ok(())
        }

        async fn pre_request(
            &self,
            _config: &EffectiveConfig,
            mut request: PreparedRequest,
        ) -> Result<PreparedRequest, PluginError> {
            (self.outcome)()?;
            request.headers.append("x-plugins", self.code);
            Ok(request)
        }
    }

    fn plugin(code: &'static str, outcome: fn() -> Result<(), PluginError>) -> Arc<HeaderPlugin> {
        Arc::new(HeaderPlugin {
            code,
            name: code,
            outcome,
        })
    }

    fn github_config() -> EffectiveConfig {
        let mut config = EffectiveConfig::default();
        config.insert("type", "github");
        config
    }

    fn supported() -> Vec<String> {
        vec!["github".to_string()]
    }

    #[tokio::test]
    async fn test_pre_request_order_and_skips() {
        let mut registry = PluginRegistry::new();
        let global = EffectiveConfig::default();
        registry.register(plugin("A", || Ok(())), &supported(), &global).unwrap();
        registry
            .register(
                plugin("B", || Err(PluginError::Failed("boom".to_string()))),
                &supported(),
                &global,
            )
            .unwrap();
        registry.register(plugin("C", || Ok(())), &supported(), &global).unwrap();

        assert!(registry.for_type("jira").is_empty());

        let request = registry
            .run_pre_request(&github_config(), PreparedRequest::default())
            .await
            .unwrap();
        assert_eq!(request.headers.get_all("x-plugins"), &["A", "C"]);
    }

    #[tokio::test]
    async fn test_blocking_error_aborts() {
        let mut registry = PluginRegistry::new();
        registry
            .register(
                plugin("BLOCK", || {
                    Err(PluginError::Blocking {
                        status: 401,
                        message: "symlink in tree".to_string(),
                    })
                }),
                &supported(),
                &EffectiveConfig::default(),
            )
            .unwrap();

        let err = registry
            .run_pre_request(&github_config(), PreparedRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Blocking { status: 401, .. }));
    }

    #[test]
    fn test_duplicates_rejected_and_disabled_skipped() {
        let mut registry = PluginRegistry::new();
        let global = EffectiveConfig::default();
        registry.register(plugin("A", || Ok(())), &supported(), &global).unwrap();
        assert!(matches!(
            registry.register(plugin("A", || Ok(())), &supported(), &global),
            Err(PluginError::Duplicate(_))
        ));

        let mut disabled = EffectiveConfig::default();
        disabled.insert("DISABLE_Z_PLUGIN", "true");
        registry.register(plugin("Z", || Ok(())), &supported(), &disabled).unwrap();
        assert_eq!(registry.for_type("github").len(), 1);
    }

    #[tokio::test]
    async fn test_start_up_writes_store() {
        let mut registry = PluginRegistry::new();
        registry
            .register(plugin("A", || Ok(())), &supported(), &EffectiveConfig::default())
            .unwrap();

        registry
            .run_start_up("my github", &github_config(), &["c1".to_string()])
            .await;

        let store = registry.store();
        assert_eq!(store.get_value("my github", "MINTED_BY"), Some(Value::from("A")));
        assert_eq!(store.get_value("my github", "CTX_c1"), Some(Value::Bool(true)));
        store.remove("my github");
        assert!(store.get("my github").is_none());
    }
}
