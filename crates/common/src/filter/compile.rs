use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cache::pattern_cache;
use super::path::template_to_regex;
use super::predicate::{LazyBody, check_predicates};
use super::rule::{ANY_METHODS, Rule};
use crate::protocol::RequestPayload;
use crate::validation::is_normalized;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Failed to read rules from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid rule file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Directional rule lists as written in accept files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSet {
    /// Local requests allowed to be relayed across the tunnel
    #[serde(default)]
    pub public: Vec<Rule>,

    /// Tunnel requests allowed to be executed on this side
    #[serde(default)]
    pub private: Vec<Rule>,
}

impl RuleSet {
    /// Put `other` in front so its rules win over the existing ones
    pub fn prepend(&mut self, other: RuleSet) {
        let mut public = other.public;
        public.append(&mut self.public);
        self.public = public;

        let mut private = other.private;
        private.append(&mut self.private);
        self.private = private;
    }
}

/// Accept file: a classic rule set, or one rule set per connection type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleFile {
    Classic(RuleSet),
    ByType(BTreeMap<String, RuleSet>),
}

impl RuleFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| FilterError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    path_pattern: String,
}

/// Compiled accept rules for one direction
///
/// Rules are bucketed by lowercase method in insertion order; the first rule whose
/// path template and predicates accept the request wins.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    buckets: HashMap<String, Vec<Arc<CompiledRule>>>,
    connection_type: Option<String>,
    rule_count: usize,
}

impl Filter {
    pub fn compile(rules: &[Rule]) -> Self {
        Self::compile_for_type(rules, None)
    }

    /// Compile rules whose matches are annotated with `connection_type`
    pub fn compile_for_type(rules: &[Rule], connection_type: Option<&str>) -> Self {
        let cache = pattern_cache();
        let mut buckets: HashMap<String, Vec<Arc<CompiledRule>>> = HashMap::new();

        for rule in rules {
            let path_pattern = template_to_regex(&rule.path);
            // warm the cache so a bad template is reported at load time
            cache.is_match(&path_pattern, "");

            let compiled = Arc::new(CompiledRule {
                rule: rule.clone(),
                path_pattern,
            });

            let method = rule.method.to_ascii_lowercase();
            if method == "any" {
                for m in ANY_METHODS {
                    buckets.entry(m.to_string()).or_default().push(compiled.clone());
                }
            } else {
                buckets.entry(method).or_default().push(compiled);
            }
        }

        Self {
            buckets,
            connection_type: connection_type.map(str::to_string),
            rule_count: rules.len(),
        }
    }

    /// Return a copy of the first accepting rule, or `None` when the request is denied
    pub fn matches(&self, payload: &RequestPayload) -> Option<Rule> {
        let method = if payload.method.is_empty() {
            "get".to_string()
        } else {
            payload.method.to_ascii_lowercase()
        };
        let bucket = self.buckets.get(&method)?;

        if !is_normalized(&payload.url) {
            warn!("Rejecting request with non-normalized url: {}", payload.url);
            return None;
        }

        let url = payload.url.split('#').next().unwrap_or_default();
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (url, None),
        };

        let cache = pattern_cache();
        let body = LazyBody::new(payload.body.as_deref());

        let matched = bucket.iter().find(|compiled| {
            cache.is_match(&compiled.path_pattern, path)
                && check_predicates(
                    &compiled.rule.valid,
                    &body,
                    query,
                    &payload.headers,
                    cache,
                )
        })?;

        debug!("Request {} {} matched rule {}", method, path, matched.rule.path);
        let mut rule = matched.rule.clone();
        if self.connection_type.is_some() {
            rule.connection_type = self.connection_type.clone();
        }
        Some(rule)
    }

    pub fn len(&self) -> usize {
        self.rule_count
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }
}

/// Inbound (`private`) and outbound (`public`) filters of one rule set
#[derive(Debug, Clone, Default)]
pub struct CompiledFilterSet {
    pub inbound: Filter,
    pub outbound: Filter,
}

impl CompiledFilterSet {
    pub fn compile(set: &RuleSet, connection_type: Option<&str>) -> Self {
        Self {
            inbound: Filter::compile_for_type(&set.private, connection_type),
            outbound: Filter::compile_for_type(&set.public, connection_type),
        }
    }
}

/// All compiled filters of a process
#[derive(Debug, Clone)]
pub enum Filters {
    Classic(CompiledFilterSet),
    ByType(HashMap<String, CompiledFilterSet>),
}

impl Default for Filters {
    fn default() -> Self {
        Filters::Classic(CompiledFilterSet::default())
    }
}

impl Filters {
    pub fn compile(file: &RuleFile) -> Self {
        match file {
            RuleFile::Classic(set) => Filters::Classic(CompiledFilterSet::compile(set, None)),
            RuleFile::ByType(sets) => Filters::ByType(
                sets.iter()
                    .map(|(ty, set)| (ty.clone(), CompiledFilterSet::compile(set, Some(ty))))
                    .collect(),
            ),
        }
    }

    /// Load and compile an accept file, returning the raw file alongside
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, RuleFile), FilterError> {
        let file = RuleFile::load(path.as_ref())?;
        let filters = Self::compile(&file);
        info!(
            "Loaded accept rules from {} ({} filter sets)",
            path.as_ref().display(),
            filters.set_count()
        );
        Ok((filters, file))
    }

    /// Filter set for a connection type; classic sets apply to every type
    pub fn for_type(&self, connection_type: Option<&str>) -> Option<&CompiledFilterSet> {
        match self {
            Filters::Classic(set) => Some(set),
            Filters::ByType(sets) => connection_type.and_then(|ty| sets.get(ty)),
        }
    }

    fn set_count(&self) -> usize {
        match self {
            Filters::Classic(_) => 1,
            Filters::ByType(sets) => sets.len(),
        }
    }
}
