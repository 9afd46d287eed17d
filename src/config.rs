//! Pipeline configuration
//!
//! Every deadline and bound is configuration, not a hard-coded constant.
//! Loaded from the environment by the binaries; tests construct values
//! directly.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// End-to-end deadline for one request. When it elapses the request
    /// is forced to `ERRORED` with a timeout fallback and outstanding
    /// sub-calls are abandoned.
    pub request_deadline: Duration,
    /// Deadline for the response-generator call.
    pub generation_deadline: Duration,
    /// Deadline for one external data provider call. When it elapses only
    /// that provider's context degrades to unavailable.
    pub provider_deadline: Duration,
    /// Number of passages requested from the retrieval store.
    pub retrieval_k: usize,
    /// TTL applied when a provider does not declare its own.
    pub cache_default_ttl: Duration,
    /// Cap on distinct cache keys; 0 means unbounded.
    pub cache_max_entries: usize,
    /// In-flight requests allowed per client.
    pub max_in_flight_per_client: usize,
    /// Connected clients allowed at once.
    pub max_clients: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(30),
            generation_deadline: Duration::from_secs(30),
            provider_deadline: Duration::from_secs(5),
            retrieval_k: 5,
            cache_default_ttl: Duration::from_secs(30),
            cache_max_entries: 1024,
            max_in_flight_per_client: 8,
            max_clients: 100,
        }
    }
}

impl PipelineConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            request_deadline: env_secs("REQUEST_DEADLINE_SECS", defaults.request_deadline),
            generation_deadline: env_secs("GENERATION_DEADLINE_SECS", defaults.generation_deadline),
            provider_deadline: env_secs("PROVIDER_DEADLINE_SECS", defaults.provider_deadline),
            retrieval_k: env_usize("RETRIEVAL_K", defaults.retrieval_k),
            cache_default_ttl: env_secs("CACHE_DEFAULT_TTL_SECS", defaults.cache_default_ttl),
            cache_max_entries: env_usize("CACHE_MAX_ENTRIES", defaults.cache_max_entries),
            max_in_flight_per_client: env_usize(
                "MAX_IN_FLIGHT_PER_CLIENT",
                defaults.max_in_flight_per_client,
            ),
            max_clients: env_usize("MAX_CONCURRENT_CLIENTS", defaults.max_clients),
        }
    }
}

fn env_secs(key: &str, fallback: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

fn env_usize(key: &str, fallback: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.request_deadline, Duration::from_secs(30));
        assert_eq!(config.provider_deadline, Duration::from_secs(5));
        assert!(config.retrieval_k > 0);
    }
}
