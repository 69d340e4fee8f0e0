//! Resilience Engine Configuration
//!
//! Handles loading, validation, and defaulting of engine configuration from
//! files and environment variables (prefix `RESILIENCE`, `__` separator).
//! Every section defaults sensibly so an empty source yields a runnable
//! configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{breaker_defaults, coordinator_defaults, health_defaults, prediction_defaults};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Coordinator behavior
    pub coordinator: CoordinatorConfig,

    /// Circuit breaker tuning, shared by every breaker
    pub circuit_breaker: CircuitBreakerConfig,

    /// Health monitor and probe loop
    pub health: HealthConfig,

    /// Predictive failure analytics
    pub prediction: PredictionConfig,

    /// Fallback cache behavior
    pub cache: CacheConfig,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Default per-call timeout in milliseconds, used when a strategy does
    /// not declare its own
    pub default_timeout_ms: u64,

    /// Source name stamped on emitted events
    pub source_service: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: coordinator_defaults::DEFAULT_TIMEOUT_MS,
            source_service: coordinator_defaults::SOURCE_SERVICE.to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker
    pub consecutive_failure_threshold: u32,

    /// Trailing outcomes kept per breaker for rate calculations
    pub window_size: usize,

    /// Failure fraction over the window that trips a closed breaker
    pub failure_rate_threshold: f64,

    /// Minimum outcomes in the window before the rate applies
    pub min_window_calls: usize,

    /// Cooldown after the first open, in seconds
    pub base_cooldown_seconds: u64,

    /// Cooldown ceiling under exponential backoff, in seconds
    pub max_cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: breaker_defaults::CONSECUTIVE_FAILURE_THRESHOLD,
            window_size: breaker_defaults::WINDOW_SIZE,
            failure_rate_threshold: breaker_defaults::FAILURE_RATE_THRESHOLD,
            min_window_calls: breaker_defaults::MIN_WINDOW_CALLS,
            base_cooldown_seconds: breaker_defaults::BASE_COOLDOWN_SECONDS,
            max_cooldown_seconds: breaker_defaults::MAX_COOLDOWN_SECONDS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn base_cooldown(&self) -> Duration {
        Duration::from_secs(self.base_cooldown_seconds)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_seconds)
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Enable the periodic probe loop
    pub enabled: bool,

    /// Probe interval per target in seconds
    pub probe_interval_seconds: u64,

    /// Probe timeout in seconds
    pub probe_timeout_seconds: u64,

    /// Smoothing factor for latency/availability moving averages, (0, 1]
    pub ewma_alpha: f64,

    /// Latency target in milliseconds; degraded above it, unhealthy at 2x
    pub latency_target_ms: f64,

    /// Consecutive failed probes before a target is declared offline
    pub offline_after_failures: u32,

    /// Ceiling for per-target probe backoff, in seconds
    pub max_probe_backoff_seconds: u64,

    /// Concurrent probes allowed per sweep
    pub max_concurrent_probes: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval_seconds: health_defaults::PROBE_INTERVAL_SECONDS,
            probe_timeout_seconds: health_defaults::PROBE_TIMEOUT_SECONDS,
            ewma_alpha: health_defaults::EWMA_ALPHA,
            latency_target_ms: health_defaults::LATENCY_TARGET_MS,
            offline_after_failures: health_defaults::OFFLINE_AFTER_FAILURES,
            max_probe_backoff_seconds: health_defaults::MAX_PROBE_BACKOFF_SECONDS,
            max_concurrent_probes: health_defaults::MAX_CONCURRENT_PROBES,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn max_probe_backoff(&self) -> Duration {
        Duration::from_secs(self.max_probe_backoff_seconds)
    }
}

/// Predictive analytics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Enable trend-based failure prediction
    pub enabled: bool,

    /// Trailing samples kept per target
    pub window_size: usize,

    /// Samples required before a trend is computed
    pub min_samples: usize,

    /// Probability at which a recommendation is emitted
    pub failure_probability_threshold: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: prediction_defaults::WINDOW_SIZE,
            min_samples: prediction_defaults::MIN_SAMPLES,
            failure_probability_threshold: prediction_defaults::PROBABILITY_THRESHOLD,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Multiple of a strategy's max age that stale-while-revalidate
    /// entries are retained for
    pub stale_retention_factor: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_retention_factor: 4,
        }
    }
}

impl ResilienceConfig {
    /// Load configuration from an optional file plus `RESILIENCE__*`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        if let Some(path) = path {
            settings =
                settings.add_source(config::File::from(path.to_path_buf()).required(false));
        }

        settings =
            settings.add_source(config::Environment::with_prefix("RESILIENCE").separator("__"));

        let config: ResilienceConfig = settings
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate().context("Configuration validation failed")?;

        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.default_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Default timeout cannot be 0"));
        }

        let breaker = &self.circuit_breaker;
        if breaker.consecutive_failure_threshold == 0 {
            return Err(anyhow::anyhow!(
                "Circuit breaker failure threshold must be at least 1"
            ));
        }
        if !(0.0..=1.0).contains(&breaker.failure_rate_threshold)
            || breaker.failure_rate_threshold == 0.0
        {
            return Err(anyhow::anyhow!(
                "Circuit breaker failure rate threshold must be in (0, 1]"
            ));
        }
        if breaker.min_window_calls > breaker.window_size {
            return Err(anyhow::anyhow!(
                "Circuit breaker min window calls cannot exceed the window size"
            ));
        }
        if breaker.base_cooldown_seconds == 0
            || breaker.max_cooldown_seconds < breaker.base_cooldown_seconds
        {
            return Err(anyhow::anyhow!(
                "Circuit breaker cooldown must be positive and capped above the base"
            ));
        }

        let health = &self.health;
        if health.enabled {
            if health.probe_interval_seconds == 0 {
                return Err(anyhow::anyhow!("Probe interval must be at least 1 second"));
            }
            if health.probe_timeout_seconds >= health.probe_interval_seconds {
                return Err(anyhow::anyhow!(
                    "Probe timeout must be less than the probe interval"
                ));
            }
        }
        if !(0.0..=1.0).contains(&health.ewma_alpha) || health.ewma_alpha == 0.0 {
            return Err(anyhow::anyhow!("EWMA alpha must be in (0, 1]"));
        }
        if health.latency_target_ms <= 0.0 {
            return Err(anyhow::anyhow!("Latency target must be positive"));
        }
        if health.offline_after_failures == 0 {
            return Err(anyhow::anyhow!(
                "Offline detection requires at least 1 failed probe"
            ));
        }

        let prediction = &self.prediction;
        if prediction.enabled {
            if prediction.min_samples < 2 {
                return Err(anyhow::anyhow!(
                    "Trend estimation needs at least 2 samples"
                ));
            }
            if prediction.min_samples > prediction.window_size {
                return Err(anyhow::anyhow!(
                    "Prediction min samples cannot exceed the window size"
                ));
            }
            if !(0.0..=1.0).contains(&prediction.failure_probability_threshold) {
                return Err(anyhow::anyhow!(
                    "Failure probability threshold must be in [0, 1]"
                ));
            }
        }

        if self.cache.stale_retention_factor == 0 {
            return Err(anyhow::anyhow!("Stale retention factor must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.base_cooldown(), Duration::from_secs(30));
        assert!(config.health.probe_timeout() < config.health.probe_interval());
    }

    #[test]
    fn test_load_without_sources_uses_defaults() {
        let config = ResilienceConfig::load(None).unwrap();
        assert_eq!(
            config.coordinator.default_timeout_ms,
            coordinator_defaults::DEFAULT_TIMEOUT_MS
        );
    }

    #[test]
    fn test_rejects_timeout_longer_than_interval() {
        let mut config = ResilienceConfig::default();
        config.health.probe_timeout_seconds = config.health.probe_interval_seconds + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_failure_rate() {
        let mut config = ResilienceConfig::default();
        config.circuit_breaker.failure_rate_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_cooldowns() {
        let mut config = ResilienceConfig::default();
        config.circuit_breaker.max_cooldown_seconds = 1;
        assert!(config.validate().is_err());
    }
}
