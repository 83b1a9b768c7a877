use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::TtlCache;
use crate::clock::{Clock, SystemClock};
use crate::completer::{ChatCompleter, HttpCompleter};
use crate::env::EnvSource;
use crate::errors::RuntimeError;
use crate::model::ProviderId;
use crate::profile::ProviderProfile;
use crate::runtime::ProviderRuntime;

/// Settings shared by every runtime a factory builds.
#[derive(Clone, Debug)]
pub struct FactoryConfig {
    /// Connect timeout and longest allowed silence while reading a response.
    pub request_timeout: Duration,
    /// Maximum number of memoized runtimes.
    pub cache_capacity: usize,
    /// How long a memoized runtime is reused.
    pub cache_ttl: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            cache_capacity: 32,
            cache_ttl: Duration::from_secs(600),
        }
    }
}

impl FactoryConfig {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Builds [`ProviderRuntime`]s from profiles.
pub struct RuntimeFactory {
    config: FactoryConfig,
    env: EnvSource,
    cache: TtlCache<ProviderId, Arc<ProviderRuntime>>,
}

impl RuntimeFactory {
    pub fn new(config: FactoryConfig) -> Self {
        Self::with_parts(config, EnvSource::process(), Arc::new(SystemClock))
    }

    /// Factory reading keys and debug flags from `env`, with cache expiry
    /// driven by `clock`.
    pub fn with_parts(config: FactoryConfig, env: EnvSource, clock: Arc<dyn Clock>) -> Self {
        let cache = TtlCache::with_clock(config.cache_capacity, config.cache_ttl, clock);
        Self { config, env, cache }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn env(&self) -> &EnvSource {
        &self.env
    }

    /// Builds a runtime talking HTTP to the profile's endpoint.
    pub fn create(&self, profile: ProviderProfile) -> Result<ProviderRuntime, RuntimeError> {
        profile.validate()?;
        let api_key = profile.resolve_api_key(&self.env)?;
        let completer = HttpCompleter::new(&profile, api_key, self.config.request_timeout)?;
        debug!(provider = %profile.id, base_url = %profile.reported_endpoint(), shape = ?profile.response_shape, "created provider runtime");
        Ok(ProviderRuntime::new(
            Arc::new(profile),
            Arc::new(completer),
            self.env.clone(),
        ))
    }

    /// Builds a runtime around a caller-supplied client.
    pub fn create_with_completer(
        &self,
        profile: ProviderProfile,
        completer: Arc<dyn ChatCompleter>,
    ) -> Result<ProviderRuntime, RuntimeError> {
        profile.validate()?;
        Ok(ProviderRuntime::new(
            Arc::new(profile),
            completer,
            self.env.clone(),
        ))
    }

    /// Returns the memoized runtime for `profile.id`, building it on a miss.
    pub fn get_or_create(
        &self,
        profile: &ProviderProfile,
    ) -> Result<Arc<ProviderRuntime>, RuntimeError> {
        self.cache.get_or_try_insert_with(&profile.id, || {
            self.create(profile.clone()).map(Arc::new)
        })
    }

    /// Drops the memoized runtime for `provider`, e.g. after its key changed.
    pub fn invalidate(&self, provider: &ProviderId) {
        self.cache.remove(provider);
    }
}

impl Default for RuntimeFactory {
    fn default() -> Self {
        Self::new(FactoryConfig::default())
    }
}
