//! Resilience Coordinator
//!
//! FIELDOPS External Service Resilience & Multi-Provider Fallback
//! Coordination Engine
//!
//! The platform integrates third-party routing, geocoding, traffic,
//! messaging, and payment vendors into day-to-day operations and must keep
//! functioning when any of them degrades. This crate is the component that
//! tracks provider health, makes per-request routing decisions among
//! competing providers under cost and latency constraints, executes
//! graduated fallback strategies, and emits incident and SLA data for
//! operational visibility.
//!
//! # Features
//!
//! - **Circuit breaking**: per-(service, provider) breakers with windowed
//!   failure rates, exponential cooldown backoff, and single-probe
//!   half-open recovery
//! - **Health monitoring**: EWMA latency/availability records from active
//!   probes and passive call outcomes, with incident lifecycle management
//! - **Predictive analytics**: trailing-window trend analysis that
//!   recommends strategy changes before thresholds are crossed
//! - **Fallback coordination**: priority- and context-aware provider
//!   selection with cache, degraded-functionality, and manual-operation
//!   tiers
//! - **Service mesh views**: read-only topology snapshots for dashboards
//!
//! # Quick Start
//!
//! ```no_run
//! use resilience_coordinator::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ResilienceConfig::load(None)?;
//!     let adapters = Arc::new(AdapterRegistry::new());
//!     // adapters.insert("vendor-a", Arc::new(MyVendorAdapter::new(...)));
//!
//!     let clock: Arc<dyn resilience_coordinator::clock::Clock> =
//!         Arc::new(resilience_coordinator::clock::SystemClock);
//!     let cache = Arc::new(InMemoryCache::new(clock));
//!     let coordinator =
//!         FallbackCoordinator::new(config, adapters, cache, Arc::new(NoopEventSink));
//!
//!     coordinator.health().start_monitoring().await?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod adapter;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod health;
pub mod incident;
pub mod mesh;
pub mod models;
pub mod strategy;

// Re-export commonly used types
pub use adapter::{
    AdapterRegistry, AdapterResponse, BatchResponse, OperationRequest, ProviderAdapter,
    ProviderFailure,
};
pub use cache::{CachedEntry, FallbackCache, InMemoryCache};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::ResilienceConfig;
pub use coordinator::FallbackCoordinator;
pub use health::{HealthMonitor, HealthMonitoringStats};
pub use incident::{EventSink, IncidentLog, NoopEventSink};
pub use mesh::ServiceMeshAggregator;
pub use models::{
    BusinessContext, ExecutionOptions, ExecutionResult, FallbackStrategy, FailurePrediction,
    HealthRecord, HealthState, HealthStatusReport, Incident, ManualCheckOutcome, ProviderConfig,
    RegisterStrategyRequest, ServiceHealthSummary, ServiceMeshStatus, StrategyType,
    UpdateStrategyRequest,
};
pub use strategy::StrategyRegistry;

/// Resilience engine errors
///
/// Provider failures are recovered locally by advancing to the next
/// candidate or tier and only ever reach callers inside
/// [`ExecutionResult`] metadata; configuration and validation errors fail
/// fast.
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("No fallback strategy registered for service: {0}")]
    StrategyNotFound(String),

    #[error("Provider failure: {0}")]
    Provider(#[from] adapter::ProviderFailure),

    #[error("No provider within cost/latency budget for service: {0}")]
    BudgetExceeded(String),

    #[error("All fallback tiers exhausted for service: {0}")]
    FallbackExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResilienceError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result type alias for the resilience engine
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Circuit breaker default settings
pub mod breaker_defaults {
    pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 5;
    pub const WINDOW_SIZE: usize = 20;
    pub const FAILURE_RATE_THRESHOLD: f64 = 0.5;
    pub const MIN_WINDOW_CALLS: usize = 10;
    pub const BASE_COOLDOWN_SECONDS: u64 = 30;
    pub const MAX_COOLDOWN_SECONDS: u64 = 300;
}

/// Health monitor default settings
pub mod health_defaults {
    pub const PROBE_INTERVAL_SECONDS: u64 = 30;
    pub const PROBE_TIMEOUT_SECONDS: u64 = 5;
    pub const EWMA_ALPHA: f64 = 0.15;
    pub const LATENCY_TARGET_MS: f64 = 1_000.0;
    pub const OFFLINE_AFTER_FAILURES: u32 = 5;
    pub const MAX_PROBE_BACKOFF_SECONDS: u64 = 600;
    pub const MAX_CONCURRENT_PROBES: usize = 32;
}

/// Predictive analytics default settings
pub mod prediction_defaults {
    pub const WINDOW_SIZE: usize = 10;
    pub const MIN_SAMPLES: usize = 3;
    pub const PROBABILITY_THRESHOLD: f64 = 0.7;
}

/// Coordinator default settings
pub mod coordinator_defaults {
    pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
    pub const SOURCE_SERVICE: &str = "resilience-coordinator";
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        adapter::{AdapterRegistry, AdapterResponse, OperationRequest, ProviderAdapter},
        cache::{FallbackCache, InMemoryCache},
        config::ResilienceConfig,
        coordinator::FallbackCoordinator,
        incident::{EventSink, NoopEventSink},
        models::{
            BusinessContext, ExecutionOptions, ExecutionResult, ProviderConfig,
            RegisterStrategyRequest, StrategyType, UpdateStrategyRequest,
        },
        ResilienceError, Result,
    };
    pub use fieldops_shared::{
        BusinessCriticality, DegradationLevel, OperationKind, Urgency,
    };
}
