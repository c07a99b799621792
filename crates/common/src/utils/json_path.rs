use serde_json::Value;

/// Look up a dotted path (`a.b.0.c`) in a JSON value
///
/// Numeric segments index into arrays. Missing segments yield `None` instead of an error.
pub fn json_lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Mutable counterpart of [`json_lookup`]
pub fn json_lookup_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested() {
        let body = json!({"commits": [{"message": "fix"}], "ref": "main"});
        assert_eq!(json_lookup(&body, "ref"), Some(&json!("main")));
        assert_eq!(json_lookup(&body, "commits.0.message"), Some(&json!("fix")));
        assert!(json_lookup(&body, "commits.1.message").is_none());
        assert!(json_lookup(&body, "ref.deeper").is_none());
    }

    #[test]
    fn test_lookup_mut_replaces_in_place() {
        let mut body = json!({"settings": {"url": "${HOST}"}});
        if let Some(v) = json_lookup_mut(&mut body, "settings.url") {
            *v = json!("example.com");
        }
        assert_eq!(body, json!({"settings": {"url": "example.com"}}));
    }
}
