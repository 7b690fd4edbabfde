// Timing Jitter — per-request dispatch delays
//
// Each drained request sleeps for an independently sampled delay before the
// backend sees it, so outbound call timing cannot be lined up with inbound
// arrival timing.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Distribution type for jitter delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterDistribution {
    /// Uniform random distribution
    #[default]
    Uniform,
    /// Exponential distribution (more likely to be small delays)
    Exponential,
}

/// Configuration for jitter applied to backend dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterConfig {
    /// Minimum delay in milliseconds
    pub min_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Distribution type for jitter
    pub distribution: JitterDistribution,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 2000,
            distribution: JitterDistribution::Uniform,
        }
    }
}

impl JitterConfig {
    /// Validate jitter configuration
    ///
    /// `[0, 0]` is allowed and disables mixing delay entirely.
    pub fn validate(&self) -> Result<(), JitterError> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(JitterError::InvalidConfig(
                "min_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JitterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Timing jitter generator for dispatch tasks
#[derive(Debug, Clone)]
pub struct TimingJitter {
    config: JitterConfig,
}

impl TimingJitter {
    /// Create a new timing jitter with the given configuration
    pub fn new(config: JitterConfig) -> Result<Self, JitterError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Compute a random jitter delay based on the configuration
    pub fn compute_jitter(&self) -> Duration {
        compute_jitter(&self.config)
    }

    /// Get the configuration
    pub fn config(&self) -> &JitterConfig {
        &self.config
    }
}

/// Compute a random jitter delay
///
/// Generates a random delay between min and max (both inclusive) according
/// to the configured distribution type.
pub fn compute_jitter(config: &JitterConfig) -> Duration {
    let mut rng = rand::thread_rng();
    let range = config.max_delay_ms.saturating_sub(config.min_delay_ms);

    let delay_ms = match config.distribution {
        JitterDistribution::Uniform => rng.gen_range(config.min_delay_ms..=config.max_delay_ms),
        JitterDistribution::Exponential => {
            // Mean at a quarter of the range, clamped to max
            let uniform: f64 = rng.gen_range(f64::EPSILON..1.0);
            let mean = range as f64 / 4.0;
            let scaled = (-uniform.ln() * mean) as u64;
            config.min_delay_ms + scaled.min(range)
        }
    };

    Duration::from_millis(delay_ms)
}
