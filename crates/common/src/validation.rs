//! Input validation for security-critical data
//!
//! Path normalization for traversal detection, broker version parsing for the identify
//! handshake, and the parsing of routing prefixes that arrive in relayed URLs.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// `/ctx/<uuid>` prefix selecting a per-context configuration
static CONTEXT_PREFIX_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/ctx/([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})")
        .unwrap()
});

static VERSION_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)").unwrap());

/// Broker tokens in URLs: uuid-like, no path separators
static BROKER_TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{8,128}$").unwrap());

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid broker token format: {0}")]
    InvalidToken(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),
}

/// Normalize a path the way POSIX `path.normalize` does
///
/// Repeated separators collapse, `.` segments vanish and `..` pops the previous segment.
/// A trailing separator is preserved.
///
/// ```
/// use broker_common::validation::normalize_path;
///
/// assert_eq!(normalize_path("/a//b/./c/../d"), "/a/b/d");
/// assert_eq!(normalize_path("/a/b/"), "/a/b/");
/// ```
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    let mut normalized = segments.join("/");
    if absolute {
        normalized.insert(0, '/');
    }
    if normalized.is_empty() {
        normalized.push('.');
    }
    if trailing && !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// A URL is safe to match only when normalizing it is a no-op
pub fn is_normalized(url: &str) -> bool {
    normalize_path(url) == url
}

/// Split a `/ctx/<uuid>` prefix off a relayed URL
///
/// Returns the context id (if any) and the remaining URL, which always starts with `/`.
pub fn strip_context_prefix(url: &str) -> (Option<String>, String) {
    match CONTEXT_PREFIX_REGEX.captures(url) {
        Some(caps) => {
            let rest = &url[caps[0].len()..];
            let rest = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{}", rest)
            };
            (Some(caps[1].to_string()), rest)
        }
        None => (None, url.to_string()),
    }
}

/// Parse `major.minor.patch` (optionally `v`-prefixed, with any suffix ignored)
pub fn parse_version(version: &str) -> Result<(u64, u64, u64), ValidationError> {
    let caps = VERSION_REGEX
        .captures(version.trim())
        .ok_or_else(|| ValidationError::InvalidVersion(version.chars().take(50).collect()))?;

    let part = |i: usize| {
        caps[i]
            .parse::<u64>()
            .map_err(|_| ValidationError::InvalidVersion(version.chars().take(50).collect()))
    };
    Ok((part(1)?, part(2)?, part(3)?))
}

/// Whether `version` is strictly older than `minimum`
///
/// Unparseable versions are treated as older than anything.
pub fn version_below(version: &str, minimum: &str) -> bool {
    match (parse_version(version), parse_version(minimum)) {
        (Ok(v), Ok(min)) => v < min,
        (Err(_), _) => true,
        (Ok(_), Err(_)) => false,
    }
}

/// Validate broker token format before it is used as a routing key
pub fn validate_broker_token(token: &str) -> Result<(), ValidationError> {
    if !BROKER_TOKEN_REGEX.is_match(token) {
        return Err(ValidationError::InvalidToken(
            token.chars().take(8).collect::<String>(), // never echo the full token
        ));
    }
    Ok(())
}
