use std::collections::HashMap;
use std::sync::Arc;

use chatstream_runtime::{ProviderId, ProviderRuntime, RuntimeError, RuntimeFactory};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::errors::CoreError;

/// Runtimes available to the orchestration layer, keyed by provider id.
#[derive(Clone, Default)]
pub struct RuntimeSet {
    runtimes: HashMap<ProviderId, Arc<ProviderRuntime>>,
}

impl RuntimeSet {
    pub fn builder() -> RuntimeSetBuilder {
        RuntimeSetBuilder::default()
    }

    /// Builds a runtime for every effective profile in `settings`.
    ///
    /// Profiles whose API key is missing are skipped with a warning so one
    /// unconfigured provider does not take the others down. Any other
    /// construction error is returned.
    pub fn from_settings(settings: &Settings, factory: &RuntimeFactory) -> Result<Self, CoreError> {
        let mut builder = Self::builder();
        for profile in settings.effective_profiles() {
            match factory.get_or_create(&profile) {
                Ok(runtime) => builder = builder.register(runtime),
                Err(RuntimeError::MissingApiKey { provider, env }) => {
                    warn!(%provider, %env, "skipping provider without api key");
                }
                Err(err) => return Err(err.into()),
            }
        }
        builder.build()
    }

    pub fn get(&self, provider: &ProviderId) -> Result<Arc<ProviderRuntime>, CoreError> {
        self.runtimes
            .get(provider)
            .cloned()
            .ok_or_else(|| CoreError::UnknownProvider(provider.clone()))
    }

    pub fn contains(&self, provider: &ProviderId) -> bool {
        self.runtimes.contains_key(provider)
    }

    /// Registered provider ids, sorted.
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<_> = self.runtimes.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }
}

/// Collects runtimes before freezing them into a [`RuntimeSet`].
#[derive(Default)]
pub struct RuntimeSetBuilder {
    runtimes: Vec<Arc<ProviderRuntime>>,
}

impl RuntimeSetBuilder {
    /// Register one runtime per provider id.
    pub fn register(mut self, runtime: Arc<ProviderRuntime>) -> Self {
        self.runtimes.push(runtime);
        self
    }

    /// Fails on duplicate provider ids.
    pub fn build(self) -> Result<RuntimeSet, CoreError> {
        let mut runtimes = HashMap::new();
        for runtime in self.runtimes {
            let id = runtime.id().clone();
            if runtimes.contains_key(&id) {
                return Err(CoreError::settings(format!(
                    "duplicate provider registration: {id}"
                )));
            }
            debug!(provider = %id, "registered runtime");
            runtimes.insert(id, runtime);
        }
        Ok(RuntimeSet { runtimes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatstream_runtime::{Clock, EnvSource, FactoryConfig, ManualClock, ProviderProfile};

    fn factory(env: EnvSource) -> RuntimeFactory {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        RuntimeFactory::with_parts(FactoryConfig::default(), env, clock)
    }

    #[test]
    fn build_rejects_duplicate_provider_ids() {
        let factory = factory(EnvSource::empty());
        let first = Arc::new(factory.create(ProviderProfile::ollama()).expect("runtime"));
        let second = Arc::new(factory.create(ProviderProfile::ollama()).expect("runtime"));
        let result = RuntimeSet::builder().register(first).register(second).build();
        assert!(
            matches!(result, Err(CoreError::Settings(message)) if message.contains("duplicate provider"))
        );
    }

    #[test]
    fn from_settings_skips_providers_without_keys() {
        let factory = factory(EnvSource::from_pairs([("DEEPSEEK_API_KEY", "sk-test")]));
        let set = RuntimeSet::from_settings(&Settings::default(), &factory).expect("set");
        let ids: Vec<_> = set.provider_ids().into_iter().map(|id| id.0).collect();
        assert_eq!(ids, vec!["deepseek", "ollama"]);
        assert!(matches!(
            set.get(&ProviderId::new("openai")),
            Err(CoreError::UnknownProvider(_))
        ));
    }
}
