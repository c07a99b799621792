//! Connection configuration and credential-config resolution
//!
//! A broker config file holds global values, per-type defaults and the configured
//! connections. Resolving a connection identifier (optionally with a context id) yields
//! a flat [`EffectiveConfig`] with placeholders expanded.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, error};

use crate::error::{BrokerError, Result};

/// Key under which shared defaults for every type are declared
pub const COMMON_TYPE: &str = "common";

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}|\$([A-Za-z0-9_]+)").unwrap());

/// Flat key/value map a request is transformed against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectiveConfig {
    values: Map<String, Value>,
}

impl EffectiveConfig {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Scalar value rendered as a string
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(value_as_string)
    }

    /// Pool values from an array or a comma-separated string
    pub fn get_pool(&self, key: &str) -> Option<Vec<String>> {
        let pool: Vec<String> = match self.values.get(key)? {
            Value::Array(items) => items.iter().filter_map(value_as_string).collect(),
            Value::String(s) => s
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect(),
            _ => return None,
        };
        (!pool.is_empty()).then_some(pool)
    }

    /// `true`, `"true"` and `"1"` count as set
    pub fn is_truthy(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            _ => false,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn connection_type(&self) -> Option<String> {
        self.get_str("type")
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Overlay `other` on top of these values
    pub fn merge(&mut self, other: &Map<String, Value>) {
        for (k, v) in other {
            self.values.insert(k.clone(), v.clone());
        }
    }
}

impl From<Map<String, Value>> for EffectiveConfig {
    fn from(values: Map<String, Value>) -> Self {
        Self::new(values)
    }
}

/// Defaults declared for one connection type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDefaults {
    #[serde(default)]
    pub default: Map<String, Value>,
    #[serde(default)]
    pub required: Map<String, Value>,
}

/// A configured connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(rename = "type")]
    pub connection_type: String,

    /// Broker token; a connection without one has no sockets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, Map<String, Value>>,

    #[serde(default)]
    pub is_disabled: bool,

    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl ConnectionConfig {
    pub fn new(connection_type: &str, identifier: Option<&str>) -> Self {
        Self {
            connection_type: connection_type.to_string(),
            identifier: identifier.map(str::to_string),
            ..Default::default()
        }
    }

    fn context(&self, context_id: &str) -> Option<&Map<String, Value>> {
        self.contexts
            .get(context_id)
            .filter(|ctx| !ctx.get("isDisabled").is_some_and(|v| v == &Value::Bool(true)))
    }
}

/// Broker configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    #[serde(default)]
    pub broker_client_configuration: BTreeMap<String, TypeDefaults>,

    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,

    /// Every other top-level value is global
    #[serde(flatten)]
    pub global: Map<String, Value>,
}

impl BrokerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::ConfigurationInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| BrokerError::ConfigurationInvalid(format!("malformed config: {}", e)))
    }

    /// Find a connection by its identifier, returning its name
    pub fn find_by_identifier(&self, identifier: &str) -> Option<(&str, &ConnectionConfig)> {
        self.connections
            .iter()
            .find(|(_, c)| c.identifier.as_deref() == Some(identifier))
            .map(|(name, c)| (name.as_str(), c))
    }

    /// Defaults for a type: common then type-specific
    pub fn type_defaults(&self, connection_type: &str) -> Map<String, Value> {
        let mut merged = Map::new();
        if let Some(common) = self.broker_client_configuration.get(COMMON_TYPE) {
            merged.extend(common.default.clone());
            merged.extend(common.required.clone());
        }
        if let Some(defaults) = self.broker_client_configuration.get(connection_type) {
            merged.extend(defaults.default.clone());
        }
        merged
    }

    fn allowed_context_keys(&self, connection_type: &str) -> BTreeSet<String> {
        [COMMON_TYPE, connection_type]
            .iter()
            .filter_map(|ty| self.broker_client_configuration.get(*ty))
            .flat_map(|d| d.default.keys().chain(d.required.keys()))
            .cloned()
            .collect()
    }

    /// Merged configuration of a named connection, without context overrides
    pub fn resolve_connection(
        &self,
        name: &str,
        runtime: Option<&Map<String, Value>>,
    ) -> Result<EffectiveConfig> {
        let connection = self.connections.get(name).ok_or_else(|| {
            BrokerError::ConfigurationInvalid(format!("unknown connection {}", name))
        })?;
        Ok(self.merge(connection, None, runtime))
    }

    /// Resolve the effective configuration for a connection identifier
    ///
    /// Precedence, lowest first: global values, type defaults, connection values,
    /// context overrides, runtime values written by plugins.
    pub fn resolve_for_identifier(
        &self,
        identifier: &str,
        context_id: Option<&str>,
        runtime: &dyn Fn(&str) -> Option<Map<String, Value>>,
    ) -> Result<EffectiveConfig> {
        let Some((name, connection)) = self.find_by_identifier(identifier) else {
            error!(
                "Unable to find configuration type for {}. Please review config.",
                crate::utils::mask_token(identifier)
            );
            return Err(BrokerError::ConfigurationInvalid(format!(
                "no connection for identifier {}",
                crate::utils::mask_token(identifier)
            )));
        };

        let context = match context_id {
            Some(id) => Some(connection.context(id).ok_or_else(|| {
                error!("Unable to find active context {} for {}", id, name);
                BrokerError::ConfigurationInvalid(format!(
                    "Unable to find context {} for {}",
                    id, name
                ))
            })?),
            None => None,
        };

        let runtime = runtime(name);
        Ok(self.merge(connection, context, runtime.as_ref()))
    }

    fn merge(
        &self,
        connection: &ConnectionConfig,
        context: Option<&Map<String, Value>>,
        runtime: Option<&Map<String, Value>>,
    ) -> EffectiveConfig {
        let mut merged = self.global.clone();
        merged.extend(self.type_defaults(&connection.connection_type));
        merged.extend(connection.values.clone());
        merged.insert(
            "type".to_string(),
            Value::String(connection.connection_type.clone()),
        );
        if let Some(identifier) = &connection.identifier {
            merged.insert("identifier".to_string(), Value::String(identifier.clone()));
        }

        if let Some(context) = context {
            let allowed = self.allowed_context_keys(&connection.connection_type);
            for (k, v) in context {
                if allowed.contains(k) {
                    merged.insert(k.clone(), v.clone());
                } else {
                    debug!("Context key {} is not allowed for injection", k);
                }
            }
        }

        if let Some(runtime) = runtime {
            merged.extend(runtime.clone());
        }

        EffectiveConfig::new(expand_placeholders(&merged))
    }
}

/// Expand `$NAME` and `${NAME}` in string values against the map itself
///
/// Unknown names are left as written.
pub fn expand_placeholders(values: &Map<String, Value>) -> Map<String, Value> {
    values
        .iter()
        .map(|(k, v)| {
            let expanded = match v {
                Value::String(s) if s.contains('$') => {
                    Value::String(expand_str(s, |name| values.get(name).and_then(value_as_string)))
                }
                other => other.clone(),
            };
            (k.clone(), expanded)
        })
        .collect()
}

fn expand_str(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER_RE
        .replace_all(input, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
