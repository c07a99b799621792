use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::EffectiveConfig;

static VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Round-robin positions of pooled variables, shared by every request
#[derive(Debug, Default)]
pub struct PoolIndex {
    positions: DashMap<String, usize>,
}

impl PoolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current position for `pool_name` and advance it, wrapping at `len`
    fn next(&self, pool_name: &str, len: usize) -> usize {
        let mut entry = self.positions.entry(pool_name.to_string()).or_insert(0);
        let idx = if *entry >= len { 0 } else { *entry };
        *entry = idx + 1;
        idx
    }
}

/// Replace `${NAME}` tokens from the config
///
/// A `NAME_POOL` (or `NAMEPool`) entry takes precedence and is cycled through. Tokens
/// with no value are left as written.
pub fn replace(template: &str, config: &EffectiveConfig, pools: &PoolIndex) -> String {
    VAR_RE
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            let pooled = [format!("{}_POOL", name), format!("{}Pool", name)]
                .into_iter()
                .find_map(|pool_name| config.get_pool(&pool_name).map(|pool| (pool_name, pool)));

            match pooled {
                Some((pool_name, pool)) => pool[pools.next(&pool_name, pool.len())].clone(),
                None => config.get_str(name).unwrap_or_else(|| caps[0].to_string()),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_substitution() {
        let mut config = EffectiveConfig::default();
        config.insert("GITHUB_API", "api.github.com");
        let pools = PoolIndex::new();

        assert_eq!(
            replace("https://${GITHUB_API}/repos", &config, &pools),
            "https://api.github.com/repos"
        );
        assert_eq!(replace("${UNKNOWN}/x", &config, &pools), "${UNKNOWN}/x");
    }

    #[test]
    fn test_pool_round_robin() {
        let mut config = EffectiveConfig::default();
        config.insert("GITHUB_TOKEN_POOL", "a,b");
        let pools = PoolIndex::new();

        let seq: Vec<String> = (0..3)
            .map(|_| replace("${GITHUB_TOKEN}", &config, &pools))
            .collect();
        assert_eq!(seq, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_camel_pool_and_array() {
        let mut config = EffectiveConfig::default();
        config.insert("TOKENPool", json!(["x", "y"]));
        config.insert("TOKEN", "ignored");
        let pools = PoolIndex::new();

        assert_eq!(replace("${TOKEN}", &config, &pools), "x");
        assert_eq!(replace("${TOKEN}", &config, &pools), "y");
    }

    #[test]
    fn test_pool_shrink_wraps() {
        let pools = PoolIndex::new();
        let mut config = EffectiveConfig::default();
        config.insert("T_POOL", "a,b,c");
        replace("${T}", &config, &pools);
        replace("${T}", &config, &pools);

        config.insert("T_POOL", "a,b");
        assert_eq!(replace("${T}", &config, &pools), "a");
    }
}
