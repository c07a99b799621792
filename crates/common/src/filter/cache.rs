use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::warn;

static PATTERN_CACHE: Lazy<PatternCache> = Lazy::new(PatternCache::new);

/// Process-wide cache shared by every compiled filter
pub fn pattern_cache() -> &'static PatternCache {
    &PATTERN_CACHE
}

#[derive(Debug)]
enum CachedPattern {
    Regex(Regex),
    Glob { regex: Regex, negate: bool },
    /// Failed to compile; never matches
    Invalid,
}

/// Compiled regex and glob patterns keyed by their source string
///
/// Each distinct pattern is compiled at most once. Globs are keyed with a `glob:`
/// prefix so the same text used as a regex and as a glob does not collide.
#[derive(Debug, Default)]
pub struct PatternCache {
    entries: DashMap<String, Arc<CachedPattern>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regex match against a cached pattern; invalid patterns never match
    pub fn is_match(&self, pattern: &str, text: &str) -> bool {
        match self.regex_entry(pattern).as_ref() {
            CachedPattern::Regex(re) => re.is_match(text),
            _ => false,
        }
    }

    /// Capture groups of a cached pattern, `None` when it does not match
    pub fn captures(&self, pattern: &str, text: &str) -> Option<Vec<String>> {
        match self.regex_entry(pattern).as_ref() {
            CachedPattern::Regex(re) => re.captures(text).map(|caps| {
                caps.iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect()
            }),
            _ => None,
        }
    }

    /// Named capture groups of a cached pattern that took part in the match
    pub fn named_captures(&self, pattern: &str, text: &str) -> Option<Vec<(String, String)>> {
        match self.regex_entry(pattern).as_ref() {
            CachedPattern::Regex(re) => re.captures(text).map(|caps| {
                re.capture_names()
                    .flatten()
                    .filter_map(|name| {
                        caps.name(name)
                            .map(|m| (name.to_string(), m.as_str().to_string()))
                    })
                    .collect()
            }),
            _ => None,
        }
    }

    /// Glob match with dotfiles allowed; a leading `!` negates
    pub fn glob_match(&self, pattern: &str, text: &str) -> bool {
        let key = format!("glob:{}", pattern);
        let entry = self.get_or_compile(&key, || {
            let (source, negate) = glob_to_regex(pattern);
            Regex::new(&source).map(|regex| CachedPattern::Glob { regex, negate })
        });

        match entry.as_ref() {
            CachedPattern::Glob { regex, negate } => regex.is_match(text) != *negate,
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn regex_entry(&self, pattern: &str) -> Arc<CachedPattern> {
        self.get_or_compile(pattern, || Regex::new(pattern).map(CachedPattern::Regex))
    }

    fn get_or_compile(
        &self,
        key: &str,
        compile: impl FnOnce() -> Result<CachedPattern, regex::Error>,
    ) -> Arc<CachedPattern> {
        if let Some(entry) = self.entries.get(key) {
            return entry.clone();
        }

        self.entries
            .entry(key.to_string())
            .or_insert_with(|| match compile() {
                Ok(pattern) => Arc::new(pattern),
                Err(e) => {
                    warn!("Invalid pattern {:?}, it will never match: {}", key, e);
                    Arc::new(CachedPattern::Invalid)
                }
            })
            .clone()
    }
}

/// Whether a value contains glob syntax
pub fn is_glob(value: &str) -> bool {
    value.contains(['*', '?', '!'])
}

/// Translate a glob into an anchored regex, returning it with the negation flag
///
/// `*` and `?` stay within one `/`-separated segment, `**` crosses segments,
/// `[...]` and `{a,b}` behave as in shell globs.
pub fn glob_to_regex(pattern: &str) -> (String, bool) {
    let mut negate = false;
    let mut rest = pattern;
    while let Some(stripped) = rest.strip_prefix('!') {
        negate = !negate;
        rest = stripped;
    }

    let chars: Vec<char> = rest.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push_str(".*");
                i += 2;
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' if i + 1 < chars.len() => {
                out.push_str(&regex::escape(&chars[i + 1].to_string()));
                i += 1;
            }
            '[' => match chars[i + 1..].iter().position(|c| *c == ']') {
                Some(len) if len > 0 => {
                    let class: String = chars[i + 1..i + 1 + len].iter().collect();
                    let class = match class.strip_prefix('!') {
                        Some(negated) => format!("^{}", negated),
                        None => class,
                    };
                    out.push('[');
                    out.push_str(&class.replace('\\', "\\\\"));
                    out.push(']');
                    i += len + 1;
                }
                _ => out.push_str("\\["),
            },
            '{' => match chars[i + 1..].iter().position(|c| *c == '}') {
                Some(len) => {
                    let body: String = chars[i + 1..i + 1 + len].iter().collect();
                    let alternatives: Vec<String> =
                        body.split(',').map(regex::escape).collect();
                    out.push_str(&format!("(?:{})", alternatives.join("|")));
                    i += len + 1;
                }
                None => out.push_str("\\{"),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    (out, negate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_compiled_once() {
        let cache = PatternCache::new();
        assert!(cache.is_match("^a+$", "aaa"));
        assert!(!cache.is_match("^a+$", "b"));
        assert_eq!(cache.len(), 1);

        assert!(cache.is_match("^a+$", "a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        let cache = PatternCache::new();
        assert!(!cache.is_match("(unclosed", "(unclosed"));
        assert!(!cache.is_match("(unclosed", "anything"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_glob_and_regex_keys_do_not_collide() {
        let cache = PatternCache::new();
        assert!(!cache.glob_match("a*", "xyz"));
        // as a regex, `a*` matches the empty string anywhere
        assert!(cache.is_match("a*", "xyz"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_glob_semantics() {
        let cache = PatternCache::new();
        assert!(cache.glob_match("release/*", "release/1.0"));
        assert!(!cache.glob_match("release/*", "release/1.0/hotfix"));
        assert!(cache.glob_match("release/**", "release/1.0/hotfix"));
        assert!(cache.glob_match("v?.0", "v1.0"));
        assert!(cache.glob_match("*", ".hidden"));
        assert!(cache.glob_match("!main", "develop"));
        assert!(!cache.glob_match("!main", "main"));
        assert!(cache.glob_match("{main,master}", "master"));
        assert!(cache.glob_match("[a-c]x", "bx"));
        assert!(!cache.glob_match("[!a-c]x", "bx"));
    }

    #[test]
    fn test_captures() {
        let cache = PatternCache::new();
        let caps = cache.captures("^/repos/([^/]+)/([^/]+)$", "/repos/org/repo").unwrap();
        assert_eq!(caps, vec!["org".to_string(), "repo".to_string()]);
        assert!(cache.captures("^/x$", "/y").is_none());

        let named = cache
            .named_captures("^/(?P<ORG>[^/]+)/(x)$", "/acme/x")
            .unwrap();
        assert_eq!(named, vec![("ORG".to_string(), "acme".to_string())]);
    }

    #[test]
    fn test_is_glob() {
        assert!(is_glob("feature/*"));
        assert!(is_glob("!main"));
        assert!(!is_glob("main"));
    }
}
