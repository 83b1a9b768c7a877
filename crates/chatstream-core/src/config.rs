use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chatstream_runtime::{EnvSource, FactoryConfig, ModelRef, ProviderProfile};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::CoreError;

/// Environment variable naming the settings file.
pub const CONFIG_PATH_ENV: &str = "CHATSTREAM_CONFIG";

const DEFAULT_SYSTEM_PROVIDER: &str = "openai";
const DEFAULT_SYSTEM_MODEL: &str = "gpt-4o-mini";

/// Models used by the auxiliary tasks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAgentSettings {
    #[serde(default = "default_system_model")]
    pub translation: ModelRef,
    #[serde(default = "default_system_model")]
    pub language_detection: ModelRef,
    #[serde(default = "default_system_model")]
    pub summary: ModelRef,
    /// Target language when a translation request names none.
    #[serde(default = "default_target_language")]
    pub default_target_language: String,
}

impl Default for SystemAgentSettings {
    fn default() -> Self {
        Self {
            translation: default_system_model(),
            language_detection: default_system_model(),
            summary: default_system_model(),
            default_target_language: default_target_language(),
        }
    }
}

fn default_system_model() -> ModelRef {
    ModelRef::new(DEFAULT_SYSTEM_PROVIDER, DEFAULT_SYSTEM_MODEL)
}

fn default_target_language() -> String {
    "en-US".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Connect timeout and idle gap allowed between response chunks.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_cache_capacity() -> usize {
    32
}

fn default_cache_ttl_secs() -> u64 {
    600
}

/// Application settings, usually read from `chatstream.toml`.
///
/// ```toml
/// [runtime]
/// request_timeout_secs = 60
///
/// [system_agent]
/// translation = { provider = "deepseek", model = "deepseek-chat" }
///
/// [[providers]]
/// id = "gateway"
/// base_url = "https://llm.example.com/v1"
/// api_key_env = "GATEWAY_KEY"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Extra or overriding provider profiles. Built-in profiles with the same
    /// id are replaced.
    #[serde(default)]
    pub providers: Vec<ProviderProfile>,
    #[serde(default)]
    pub system_agent: SystemAgentSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> Result<Self, CoreError> {
        let settings: Settings =
            toml::from_str(raw).map_err(|err| CoreError::settings(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            CoreError::settings(format!("cannot read {}: {err}", path.display()))
        })?;
        debug!(path = %path.display(), "loading settings");
        Self::from_toml_str(&raw)
    }

    /// Loads `path`, else the file named by `CHATSTREAM_CONFIG`, else
    /// defaults.
    pub fn load_or_default(path: Option<&Path>, env: &EnvSource) -> Result<Self, CoreError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match env.get(CONFIG_PATH_ENV) {
            Some(path) => Self::load(path),
            None => {
                debug!("no settings file, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for profile in &self.providers {
            if !seen.insert(&profile.id) {
                return Err(CoreError::settings(format!(
                    "provider {} is configured twice",
                    profile.id
                )));
            }
        }
        if self.runtime.request_timeout_secs == 0 {
            return Err(CoreError::settings("request_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Built-in profiles overlaid with the configured ones.
    pub fn effective_profiles(&self) -> Vec<ProviderProfile> {
        let mut profiles: Vec<ProviderProfile> = ProviderProfile::builtins()
            .into_iter()
            .filter(|builtin| !self.providers.iter().any(|p| p.id == builtin.id))
            .collect();
        profiles.extend(self.providers.iter().cloned());
        profiles
    }

    pub fn factory_config(&self) -> FactoryConfig {
        FactoryConfig::default()
            .request_timeout(Duration::from_secs(self.runtime.request_timeout_secs))
            .cache_capacity(self.runtime.cache_capacity)
            .cache_ttl(Duration::from_secs(self.runtime.cache_ttl_secs))
    }
}
