//! Resilience Engine Models
//!
//! Core data structures for fallback strategies, provider bindings, health
//! records, incidents, and per-request execution results. Request payloads
//! carry `validator` rules; cross-field rules (strategy type vs. attached
//! descriptors) live in the strategy registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use fieldops_shared::{
    BusinessCriticality, DegradationLevel, ImpactLevel, IncidentSeverity, IncidentType,
    OperationKind, Urgency,
};

/// Declared policy for how a service behaves when its preferred providers
/// are unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    CacheOnly,
    AlternativeProvider,
    DegradedFunctionality,
    ManualOperation,
    CircuitBreaker,
    HybridApproach,
}

/// A vendor binding for a logical service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProviderConfig {
    /// Provider identifier, unique within the owning strategy
    #[validate(length(min = 1, max = 100))]
    pub id: String,

    /// Selection priority, lower is preferred
    #[validate(range(min = 1, max = 5))]
    pub priority: u8,

    /// Cost per request in platform currency units
    #[validate(range(min = 0.0))]
    pub cost_per_request: f64,

    /// Operations this vendor can serve
    pub capabilities: Vec<OperationKind>,

    /// Geographic region the vendor serves from
    pub region: Option<String>,

    /// Per-provider timeout override in milliseconds
    pub timeout_ms: Option<u64>,
}

impl ProviderConfig {
    pub fn supports(&self, operation: OperationKind) -> bool {
        self.capabilities.contains(&operation)
    }
}

/// Cache behavior when providers are unavailable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStrategy {
    /// Maximum age a cached response may have and still be served
    pub max_age_seconds: u64,

    /// Serve entries older than `max_age_seconds` and refresh in the
    /// background instead of failing
    #[serde(default)]
    pub stale_while_revalidate: bool,
}

/// Reduced-functionality descriptor served when all providers are down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedFunctionality {
    /// Features that keep working in degraded mode
    pub enabled_features: Vec<String>,

    /// Features switched off in degraded mode
    pub disabled_features: Vec<String>,

    /// Message surfaced to end users
    pub user_message: String,

    /// Static payload served in place of a live response
    pub fallback_data: Option<serde_json::Value>,
}

/// Manual-operation descriptor for services that fall back to humans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ManualOperation {
    /// Who to page and in what order
    #[validate(length(min = 1))]
    pub escalation_path: String,

    /// Estimated time for a human to resolve one request
    pub estimated_resolution_minutes: u32,

    /// Operator instructions attached to failed results
    pub instructions: Option<String>,
}

/// Business-continuity metadata used for incident impact estimates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessContinuity {
    /// Maximum tolerable downtime before escalation
    pub max_downtime_minutes: u32,

    /// Qualitative impact of a full outage
    pub impact_level: ImpactLevel,

    /// Revenue at risk per hour of outage
    pub revenue_per_hour_at_risk: f64,
}

/// Cost-control preferences applied during provider selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostOptimization {
    /// Default ceiling on cost increase vs. the cheapest configured
    /// provider, in percent; per-request context overrides this
    pub max_cost_increase_percent: f64,

    /// Providers preferred when costs tie
    #[serde(default)]
    pub preferred_providers: Vec<String>,
}

/// Fallback policy for one logical service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackStrategy {
    /// Logical service name (e.g. "routing", "geocoding")
    pub service: String,

    /// Business criticality of the service
    pub business_criticality: BusinessCriticality,

    /// Declared fallback behavior
    pub strategy_type: StrategyType,

    /// Candidate providers ordered by priority
    pub providers: Vec<ProviderConfig>,

    /// Cache fallback settings, required for cache-driven strategies
    pub cache: Option<CacheStrategy>,

    /// Degraded-functionality descriptor
    pub degraded: Option<DegradedFunctionality>,

    /// Manual-operation descriptor
    pub manual: Option<ManualOperation>,

    /// Continuity metadata for incident reporting
    pub continuity: Option<BusinessContinuity>,

    /// Cost-control preferences
    pub cost: Option<CostOptimization>,

    /// Default per-call timeout in milliseconds
    pub default_timeout_ms: u64,

    /// Registration timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl FallbackStrategy {
    /// Providers sorted by ascending priority; ties keep declaration order
    pub fn providers_by_priority(&self) -> Vec<ProviderConfig> {
        let mut providers = self.providers.clone();
        providers.sort_by_key(|p| p.priority);
        providers
    }

    /// Cheapest configured cost, the baseline for cost-impact accounting
    pub fn cheapest_cost(&self) -> f64 {
        self.providers
            .iter()
            .map(|p| p.cost_per_request)
            .fold(f64::INFINITY, f64::min)
    }
}

/// Strategy registration payload
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterStrategyRequest {
    #[validate(length(min = 1, max = 100))]
    pub service: String,

    pub business_criticality: BusinessCriticality,

    pub strategy_type: StrategyType,

    #[validate]
    pub providers: Vec<ProviderConfig>,

    pub cache: Option<CacheStrategy>,

    pub degraded: Option<DegradedFunctionality>,

    #[validate]
    pub manual: Option<ManualOperation>,

    pub continuity: Option<BusinessContinuity>,

    pub cost: Option<CostOptimization>,

    /// Default per-call timeout; engine default applies when absent
    pub default_timeout_ms: Option<u64>,
}

/// Partial strategy update; `Some` fields replace the stored value
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateStrategyRequest {
    pub business_criticality: Option<BusinessCriticality>,

    pub strategy_type: Option<StrategyType>,

    #[validate]
    pub providers: Option<Vec<ProviderConfig>>,

    pub cache: Option<CacheStrategy>,

    pub degraded: Option<DegradedFunctionality>,

    #[validate]
    pub manual: Option<ManualOperation>,

    pub continuity: Option<BusinessContinuity>,

    pub cost: Option<CostOptimization>,

    pub default_timeout_ms: Option<u64>,
}

/// Provider health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

/// Rolling health view of one (service, provider) pair
///
/// Mutated only by the health monitor; everyone else reads snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub service: String,

    pub provider: String,

    pub status: HealthState,

    /// Exponentially-weighted moving average latency in milliseconds
    pub avg_latency_ms: f64,

    /// Exponentially-weighted availability, 0.0 to 1.0
    pub availability: f64,

    /// Timestamp of the most recent probe or passive observation
    pub last_check: Option<DateTime<Utc>>,

    /// Consecutive failed observations, probe or passive
    pub consecutive_failures: u32,

    /// Most recent failure description
    pub last_error: Option<String>,
}

impl HealthRecord {
    pub fn new(service: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            provider: provider.into(),
            status: HealthState::Healthy,
            avg_latency_ms: 0.0,
            availability: 1.0,
            last_check: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// A recorded period of degraded or unhealthy service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,

    pub service: String,

    /// Provider the incident is scoped to, if any
    pub provider: Option<String>,

    pub incident_type: IncidentType,

    pub severity: IncidentSeverity,

    pub description: String,

    pub business_impact: ImpactLevel,

    pub opened_at: DateTime<Utc>,

    pub closed_at: Option<DateTime<Utc>>,

    /// Suppresses auto-close on health recovery
    pub hold_open: bool,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// Per-request business context; biases provider selection for one call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusinessContext {
    pub urgency: Urgency,

    pub customer_facing: bool,

    pub revenue_impacting: bool,

    /// Ceiling on cost increase vs. the cheapest configured provider, in
    /// percent; overrides the strategy's cost-optimization default
    pub max_cost_increase_percent: Option<f64>,

    /// Ceiling on per-call latency in milliseconds
    pub max_latency_increase_ms: Option<u64>,
}

impl BusinessContext {
    /// Whether this call should prefer availability over cost
    pub fn is_critical_path(&self) -> bool {
        self.revenue_impacting || self.urgency == Urgency::Critical
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Overall budget for the whole candidate loop in milliseconds; once
    /// exhausted, remaining candidates are skipped and fallback tiers run
    pub deadline_ms: Option<u64>,

    /// Correlation id stamped on emitted events
    pub correlation_id: Option<Uuid>,
}

/// One provider attempt inside an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,

    pub succeeded: bool,

    /// Failure description when `succeeded` is false
    pub error: Option<String>,

    pub latency_ms: Option<u64>,
}

/// Outcome of one coordinated execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,

    pub service: String,

    pub operation: OperationKind,

    /// Provider that served the request, absent on cache/degraded paths
    pub provider: Option<String>,

    pub degradation: DegradationLevel,

    /// Cost delta vs. the cheapest configured provider, in percent
    pub cost_impact_percent: f64,

    /// Total wall time spent in the coordinator
    pub latency_ms: u64,

    pub cache_used: bool,

    pub offline_mode: bool,

    /// Every provider attempt made, in order
    pub attempts: Vec<AttemptRecord>,

    /// Actionable hints when the result is degraded or failed
    pub recommendations: Vec<String>,

    /// Operation payload; absent on failure
    pub payload: Option<serde_json::Value>,

    /// Free-form result metadata (cache age, escalation path, reasons)
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionResult {
    /// Skeleton result; callers fill in the outcome fields
    pub fn empty(service: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            success: false,
            service: service.into(),
            operation,
            provider: None,
            degradation: DegradationLevel::None,
            cost_impact_percent: 0.0,
            latency_ms: 0,
            cache_used: false,
            offline_mode: false,
            attempts: Vec::new(),
            recommendations: Vec::new(),
            payload: None,
            metadata: HashMap::new(),
        }
    }
}

/// Predictive-failure recommendation, emitted before any incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePrediction {
    pub service: String,

    pub provider: String,

    /// Estimated probability the provider degrades past its thresholds
    /// within the trailing window horizon, 0.0 to 1.0
    pub failure_probability: f64,

    /// Latency trend in milliseconds per sample
    pub latency_slope_ms: f64,

    /// Availability trend per sample
    pub availability_slope: f64,

    pub recommendation: String,

    pub generated_at: DateTime<Utc>,
}

/// Per-service provider health summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthSummary {
    pub service: String,

    pub business_criticality: BusinessCriticality,

    pub strategy_type: StrategyType,

    pub healthy_providers: u32,

    pub total_providers: u32,

    /// Best state among the service's providers, i.e. what the service can
    /// still deliver
    pub status: HealthState,
}

/// Aggregated health report returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatusReport {
    /// Worst per-service status across the report
    pub overall: HealthState,

    pub services: HashMap<String, ServiceHealthSummary>,
}

/// Topology snapshot for dashboards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMeshStatus {
    /// Watched (service, provider) pairs
    pub total_nodes: u32,

    /// Pairs currently in the `healthy` state
    pub healthy_nodes: u32,

    /// Breakers currently refusing traffic
    pub open_circuit_breakers: u32,
}

/// Result of an operator-triggered health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualCheckOutcome {
    pub records: Vec<HealthRecord>,

    /// Incident opened, escalated, or auto-closed by the check
    pub incident: Option<Incident>,
}
