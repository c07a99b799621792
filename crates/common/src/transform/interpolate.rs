use serde_json::Value;
use tracing::{debug, warn};

use super::auth_header::auth_header;
use super::vars::{PoolIndex, replace};
use crate::config::EffectiveConfig;
use crate::filter::{Rule, config_segments, pattern_cache, template_to_regex};
use crate::protocol::RequestPayload;
use crate::utils::json_lookup_mut;

/// JSON body field listing body paths to substitute
pub const BODY_VAR_SUB_FIELD: &str = "BROKER_VAR_SUB";

/// Header listing header names to substitute
pub const HEADER_VAR_SUB: &str = "x-broker-var-sub";

/// Destination URL and auth header derived from a matched rule
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolated {
    pub url: String,
    pub auth: Option<String>,
}

/// Resolve the rule's origin and auth against the effective config
///
/// For requests that arrived over the tunnel, body and header variable substitution
/// also runs on `payload` in place.
pub fn interpolate(
    rule: &Rule,
    payload: &mut RequestPayload,
    config: &EffectiveConfig,
    pools: &PoolIndex,
    via_tunnel: bool,
) -> Interpolated {
    let origin = replace(&rule.origin, config, pools);

    if via_tunnel {
        if !config.is_truthy("DISABLE_BODY_VARS_SUBSTITUTION") {
            substitute_body(payload, config, pools);
        }
        if !config.is_truthy("DISABLE_HEADER_VARS_SUBSTITUTION") {
            substitute_headers(payload, config, pools);
        }
    }

    Interpolated {
        url: format!("{}{}", origin, rewrite_path(rule, &payload.url, config)),
        auth: rule.auth.as_ref().map(|spec| auth_header(spec, config, pools)),
    }
}

/// Swap the text matched by `${NAME}` path segments for the configured values
///
/// Segments without a configured value keep the request's text.
fn rewrite_path(rule: &Rule, url: &str, config: &EffectiveConfig) -> String {
    if config_segments(&rule.path).is_empty() {
        return url.to_string();
    }

    let main = url.split('#').next().unwrap_or_default();
    let (path, query) = match main.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (main, None),
    };
    let Some(captures) = pattern_cache().named_captures(&template_to_regex(&rule.path), path) else {
        return url.to_string();
    };

    let mut rewritten = path.to_string();
    for (name, matched) in captures {
        if let Some(value) = config.get_str(&name).filter(|v| !v.is_empty()) {
            rewritten = rewritten.replacen(&matched, &value, 1);
        }
    }
    match query {
        Some(query) => format!("{}?{}", rewritten, query),
        None => rewritten,
    }
}

fn substitute_body(payload: &mut RequestPayload, config: &EffectiveConfig, pools: &PoolIndex) {
    let Some(raw) = payload.body.as_deref() else {
        return;
    };
    let Ok(Value::Object(mut body)) = serde_json::from_str::<Value>(raw) else {
        return;
    };
    let Some(paths) = body.remove(BODY_VAR_SUB_FIELD) else {
        return;
    };

    let mut body = Value::Object(body);
    let paths: Vec<String> = match paths {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|p| p.as_str().map(str::to_string))
            .collect(),
        other => {
            warn!("Ignoring malformed {}: {}", BODY_VAR_SUB_FIELD, other);
            Vec::new()
        }
    };

    for path in &paths {
        if let Some(slot) = json_lookup_mut(&mut body, path)
            && let Value::String(source) = slot
        {
            let replaced = replace(source, config, pools);
            *source = replaced;
        }
    }
    debug!("Substituted body variables at {:?}", paths);

    payload.body = Some(body.to_string());
}

fn substitute_headers(payload: &mut RequestPayload, config: &EffectiveConfig, pools: &PoolIndex) {
    let Some(names) = payload.headers.get(HEADER_VAR_SUB).map(str::to_string) else {
        return;
    };

    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if let Some(value) = payload.headers.get(name) {
            let replaced = replace(value, config, pools);
            payload.headers.insert(name, replaced);
        }
    }
    debug!("Substituted header variables in {}", names);
}
