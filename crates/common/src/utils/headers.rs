use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Case-insensitive header bag carried in tunnel payloads
///
/// Names are stored lowercased. Each name maps to one or more values; single-valued
/// headers may be written on the wire either as a string or as a one-element array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, HeaderValues>", into = "BTreeMap<String, Vec<String>>")]
pub struct Headers(BTreeMap<String, Vec<String>>);

#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl From<BTreeMap<String, HeaderValues>> for Headers {
    fn from(raw: BTreeMap<String, HeaderValues>) -> Self {
        let mut headers = Headers::new();
        for (name, values) in raw {
            match values {
                HeaderValues::One(v) => headers.append(&name, v),
                HeaderValues::Many(vs) => {
                    for v in vs {
                        headers.append(&name, v);
                    }
                }
            }
        }
        headers
    }
}

impl From<Headers> for BTreeMap<String, Vec<String>> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Replace all values of a header with a single value
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    /// Keep only headers whose (lowercased) name satisfies the predicate
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|name, _| keep(name));
    }

    /// Iterate over `(name, value)` pairs, one per value
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert HTTP headers to our internal format
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut map = Headers::new();
        for (name, value) in headers.iter() {
            let val = value.to_str().unwrap_or("").to_string();
            map.append(name.as_str(), val);
        }
        map
    }

    /// Convert to an HTTP HeaderMap, skipping names or values that are not valid HTTP
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in self.iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        headers
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k.as_ref(), v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_access() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");

        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert!(headers.contains("Content-type"));

        headers.remove("CONTENT-type");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_insert_replaces_append_accumulates() {
        let mut headers = Headers::new();
        headers.append("accept", "text/html");
        headers.append("Accept", "application/json");
        assert_eq!(headers.get_all("accept").len(), 2);

        headers.insert("accept", "*/*");
        assert_eq!(headers.get_all("accept"), &["*/*".to_string()]);
    }

    #[test]
    fn test_deserialize_string_or_array() {
        let json = r#"{"X-Request-Id":"abc","set-cookie":["a=1","b=2"]}"#;
        let headers: Headers = serde_json::from_str(json).unwrap();

        assert_eq!(headers.get("x-request-id"), Some("abc"));
        assert_eq!(headers.get_all("set-cookie").len(), 2);

        let out = serde_json::to_string(&headers).unwrap();
        assert!(out.contains(r#""x-request-id":["abc"]"#));
    }

    #[test]
    fn test_header_map_conversion_keeps_multiple_values() {
        let mut original = HeaderMap::new();
        original.insert("cookie", "session=abc".parse().unwrap());
        original.append("cookie", "token=xyz".parse().unwrap());

        let headers = Headers::from_header_map(&original);
        assert_eq!(headers.get_all("cookie").len(), 2);

        let converted = headers.to_header_map();
        assert_eq!(converted.get_all("cookie").iter().count(), 2);
    }

    #[test]
    fn test_to_header_map_skips_invalid_names() {
        let headers: Headers = [("valid-header", "value"), ("invalid header", "value")]
            .into_iter()
            .collect();

        let map = headers.to_header_map();
        assert_eq!(map.len(), 1);
        assert!(map.get("valid-header").is_some());
    }

    #[test]
    fn test_non_utf8_value_becomes_empty() {
        let mut map = HeaderMap::new();
        map.insert("x-binary", HeaderValue::from_bytes(&[0xFF, 0xFE]).unwrap());

        let headers = Headers::from_header_map(&map);
        assert_eq!(headers.get("x-binary"), Some(""));
    }
}
