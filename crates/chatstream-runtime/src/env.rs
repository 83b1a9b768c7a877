use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Parses the boolean spellings accepted by environment flags.
pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Lookup of configuration values by name.
///
/// Runtimes read API keys and debug flags through this instead of the
/// process environment directly so tests can supply their own values.
#[derive(Clone)]
pub struct EnvSource {
    lookup: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvSource {
    /// Reads the process environment.
    pub fn process() -> Self {
        Self {
            lookup: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self {
            lookup: Arc::new(move |key| values.get(key).cloned()),
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::from_map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub fn empty() -> Self {
        Self::from_map(HashMap::new())
    }

    /// Returns the value of `key`, treating blank values as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    /// Whether `key` holds a truthy flag value.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .and_then(|v| parse_bool_env(&v))
            .unwrap_or(false)
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::process()
    }
}

impl fmt::Debug for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvSource").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_accepts_common_spellings() {
        let env = EnvSource::from_pairs([("A", "1"), ("B", "yes"), ("C", "off"), ("D", "maybe"), ("E", " ")]);
        assert!(env.flag("A"));
        assert!(env.flag("B"));
        assert!(!env.flag("C"));
        assert!(!env.flag("D"));
        assert!(!env.flag("E"));
        assert!(!env.flag("MISSING"));
        assert_eq!(env.get("E"), None);
    }
}
