//! Crate-wide configuration.

use crate::breaker::CircuitBreakerConfig;
use crate::cache::CacheConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the dependency loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Fan-out limit for parallel node execution.
    pub max_parallelism: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { max_parallelism: 4 }
    }
}

/// Top-level configuration for the pipeline services.
///
/// All sections have workable defaults; deployments override only what they
/// need via deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionflowConfig {
    /// Retry policy applied to stage operations.
    pub retry: RetryPolicy,
    /// Default circuit breaker settings per operation class.
    pub breaker: CircuitBreakerConfig,
    /// Stage-result cache settings.
    pub cache: CacheConfig,
    /// Dependency loader settings.
    pub loader: LoaderConfig,
    /// How long resume tokens stay valid, in seconds.
    pub resume_token_ttl_secs: u64,
    /// How long an inactive run is kept before sweeping, in seconds.
    pub run_inactivity_ttl_secs: u64,
    /// TTL for memoized stage results, in seconds.
    pub stage_cache_ttl_secs: u64,
}

impl VisionflowConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume token TTL as a duration.
    #[must_use]
    pub fn resume_token_ttl(&self) -> Duration {
        Duration::from_secs(if self.resume_token_ttl_secs == 0 {
            600
        } else {
            self.resume_token_ttl_secs
        })
    }

    /// Run inactivity TTL as a duration.
    #[must_use]
    pub fn run_inactivity_ttl(&self) -> Duration {
        Duration::from_secs(if self.run_inactivity_ttl_secs == 0 {
            600
        } else {
            self.run_inactivity_ttl_secs
        })
    }

    /// Stage cache TTL as a duration.
    #[must_use]
    pub fn stage_cache_ttl(&self) -> Duration {
        Duration::from_secs(if self.stage_cache_ttl_secs == 0 {
            300
        } else {
            self.stage_cache_ttl_secs
        })
    }
}
