use once_cell::unsync::OnceCell;
use serde_json::Value;
use tracing::warn;

use super::cache::{PatternCache, is_glob};
use super::rule::ValidEntry;
use crate::utils::{Headers, json_lookup};

/// Request body parsed as JSON on first use, at most once per match call
pub(crate) struct LazyBody<'a> {
    raw: Option<&'a str>,
    parsed: OnceCell<Option<Value>>,
}

impl<'a> LazyBody<'a> {
    pub(crate) fn new(raw: Option<&'a str>) -> Self {
        Self {
            raw,
            parsed: OnceCell::new(),
        }
    }

    fn json(&self) -> Option<&Value> {
        self.parsed
            .get_or_init(|| {
                let raw = self.raw.filter(|r| !r.trim().is_empty())?;
                match serde_json::from_str(raw) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!("Request body is not valid JSON, body predicates fail: {}", e);
                        None
                    }
                }
            })
            .as_ref()
    }
}

/// Evaluate the `valid` predicates of a rule
///
/// Body and query predicates form one OR group, tried in the order body-equals,
/// body-regex, query. Query predicates are ANDed among themselves and fail outright
/// without a query string. Header predicates are ANDed on top.
pub(crate) fn check_predicates(
    valid: &[ValidEntry],
    body: &LazyBody<'_>,
    query: Option<&str>,
    headers: &Headers,
    cache: &PatternCache,
) -> bool {
    let mut body_values = Vec::new();
    let mut body_regexes = Vec::new();
    let mut query_params = Vec::new();
    let mut header_checks = Vec::new();

    for entry in valid {
        match entry {
            ValidEntry::BodyValue { path, value } => body_values.push((path, value)),
            ValidEntry::BodyRegex { path, regex } => body_regexes.push((path, regex)),
            ValidEntry::QueryParam {
                query_param,
                values,
            } => query_params.push((query_param, values)),
            ValidEntry::Header { header, values } => header_checks.push((header, values)),
        }
    }

    if !body_values.is_empty() || !body_regexes.is_empty() || !query_params.is_empty() {
        let mut is_valid = false;

        if !body_values.is_empty() {
            is_valid = body.json().is_some_and(|json| {
                body_values
                    .iter()
                    .any(|(path, expected)| json_lookup(json, path) == Some(*expected))
            });
        }

        if !is_valid && !body_regexes.is_empty() {
            is_valid = body.json().is_some_and(|json| {
                body_regexes.iter().any(|(path, pattern)| {
                    json_lookup(json, path)
                        .and_then(scalar_text)
                        .is_some_and(|text| cache.is_match(pattern, &text))
                })
            });
        }

        if !is_valid && !query_params.is_empty() {
            let Some(query) = query.filter(|q| !q.is_empty()) else {
                return false;
            };
            let params = parse_query(query);
            is_valid = query_params.iter().all(|(name, allowed)| {
                params
                    .iter()
                    .find(|(k, _)| k == *name)
                    .is_some_and(|(_, value)| value_allowed(value, allowed, cache))
            });
        }

        if !is_valid {
            return false;
        }
    }

    header_checks.iter().all(|(name, allowed)| {
        headers
            .get(name)
            .is_some_and(|value| allowed.iter().any(|a| a == value))
    })
}

fn value_allowed(value: &str, allowed: &[String], cache: &PatternCache) -> bool {
    allowed.iter().any(|pattern| {
        if is_glob(pattern) {
            cache.glob_match(pattern, value)
        } else {
            pattern == value
        }
    })
}

/// First value per query parameter, in order of appearance
fn parse_query(query: &str) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = Vec::new();
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        if !params.iter().any(|(existing, _)| *existing == k) {
            params.push((k.into_owned(), v.into_owned()));
        }
    }
    params
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
