// Mixer configuration — plain values handed in by whoever loads settings

use crate::cache::{DEFAULT_EVICTION_BLOCK, DEFAULT_MAX_SIZE};
use crate::mixing::{JitterConfig, JitterDistribution};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(
        "overall_wait_timeout_ms ({wait_ms}) must exceed max_delay_ms + backend_timeout_ms ({required_ms})"
    )]
    DeadlineTooShort { wait_ms: u64, required_ms: u64 },
}

/// Settings consumed by the mixing engine
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Lower bound of the per-request dispatch delay
    pub min_delay_ms: u64,
    /// Upper bound of the per-request dispatch delay
    pub max_delay_ms: u64,
    /// Shape of the delay distribution
    pub jitter_distribution: JitterDistribution,
    /// Maximum requests drained per scheduling cycle
    pub batch_size: usize,
    /// Number of dispatch loops draining the queue
    pub dispatch_workers: usize,
    /// Secret salt for correlation hashing
    pub hash_salt: String,
    /// Per-call backend deadline
    pub backend_timeout_ms: u64,
    /// How long a caller waits for its result
    pub overall_wait_timeout_ms: u64,
    /// Hash cache bound
    pub cache_max_size: usize,
    /// Entries dropped per cache eviction
    pub cache_eviction_block_size: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 2000,
            jitter_distribution: JitterDistribution::Uniform,
            batch_size: 20,
            dispatch_workers: 1,
            hash_salt: String::new(),
            backend_timeout_ms: 5000,
            overall_wait_timeout_ms: 10_000,
            cache_max_size: DEFAULT_MAX_SIZE,
            cache_eviction_block_size: DEFAULT_EVICTION_BLOCK,
        }
    }
}

impl std::fmt::Debug for MixerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixerConfig")
            .field("min_delay_ms", &self.min_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("jitter_distribution", &self.jitter_distribution)
            .field("batch_size", &self.batch_size)
            .field("dispatch_workers", &self.dispatch_workers)
            .field("hash_salt", &if self.hash_salt.is_empty() { "(unset)" } else { "<redacted>" })
            .field("backend_timeout_ms", &self.backend_timeout_ms)
            .field("overall_wait_timeout_ms", &self.overall_wait_timeout_ms)
            .field("cache_max_size", &self.cache_max_size)
            .field("cache_eviction_block_size", &self.cache_eviction_block_size)
            .finish()
    }
}

impl MixerConfig {
    /// Check every bound before the engine starts.
    ///
    /// The wait timeout has to outlast the worst-case mixing delay plus the
    /// backend deadline, otherwise callers would time out on healthy requests.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.jitter()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".to_string()));
        }
        if self.dispatch_workers == 0 {
            return Err(ConfigError::Invalid(
                "dispatch_workers must be > 0".to_string(),
            ));
        }
        if self.backend_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "backend_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.cache_max_size == 0 {
            return Err(ConfigError::Invalid(
                "cache_max_size must be > 0".to_string(),
            ));
        }
        if self.cache_eviction_block_size == 0
            || self.cache_eviction_block_size > self.cache_max_size
        {
            return Err(ConfigError::Invalid(
                "cache_eviction_block_size must be between 1 and cache_max_size".to_string(),
            ));
        }

        let required_ms = self.max_delay_ms.saturating_add(self.backend_timeout_ms);
        if self.overall_wait_timeout_ms <= required_ms {
            return Err(ConfigError::DeadlineTooShort {
                wait_ms: self.overall_wait_timeout_ms,
                required_ms,
            });
        }
        Ok(())
    }

    pub fn jitter(&self) -> JitterConfig {
        JitterConfig {
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
            distribution: self.jitter_distribution,
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn overall_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_wait_timeout_ms)
    }
}
