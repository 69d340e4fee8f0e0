//! Fallback Coordinator
//!
//! The orchestrating brain of the engine: given an operation request and a
//! business context, it selects a provider under cost and latency
//! constraints, invokes the adapter with a hard timeout, and records the
//! outcome back into the circuit breakers and health monitor. When every
//! live candidate fails it walks the strategy's fallback tiers (cache,
//! degraded functionality, manual operation) instead of raising, so
//! callers always receive a structured result that distinguishes
//! "succeeded with degradation" from "failed with exhausted fallbacks".

use dashmap::DashSet;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use fieldops_shared::{
    DegradationLevel, EventMetadata, ImpactLevel, IncidentResolution, IncidentSeverity,
    IncidentType, OperationKind, ResilienceEvent,
};

use crate::adapter::{AdapterRegistry, OperationRequest, ProviderFailure};
use crate::cache::FallbackCache;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::health::HealthMonitor;
use crate::incident::{EventSink, IncidentLog};
use crate::mesh::ServiceMeshAggregator;
use crate::models::{
    AttemptRecord, BusinessContext, ExecutionOptions, ExecutionResult, FallbackStrategy,
    HealthState, HealthStatusReport, Incident, ManualCheckOutcome, ProviderConfig,
    RegisterStrategyRequest, StrategyType, UpdateStrategyRequest,
};
use crate::strategy::StrategyRegistry;
use crate::{ResilienceError, Result};

/// Candidate plan for one execution
struct ExecutionPlan {
    strategy: FallbackStrategy,
    /// Budget- and breaker-admissible candidates in invocation order
    candidates: Vec<ProviderConfig>,
    /// Provider id -> position in the pure priority order, for degradation
    priority_rank: HashMap<String, usize>,
    /// Cheapest configured cost, the cost-impact baseline
    cheapest_cost: f64,
    /// Smallest cost-increase percentage that would admit a provider, set
    /// when every live candidate was priced out
    budget_exceeded: Option<(String, f64)>,
}

/// Multi-provider fallback coordination engine
#[derive(Clone)]
pub struct FallbackCoordinator {
    config: ResilienceConfig,
    strategies: Arc<StrategyRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthMonitor>,
    adapters: Arc<AdapterRegistry>,
    cache: Arc<dyn FallbackCache>,
    incidents: Arc<IncidentLog>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    /// Cache keys with a background refresh already in flight
    refreshing: Arc<DashSet<String>>,
}

impl FallbackCoordinator {
    pub fn new(
        config: ResilienceConfig,
        adapters: Arc<AdapterRegistry>,
        cache: Arc<dyn FallbackCache>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_clock(config, adapters, cache, sink, Arc::new(SystemClock))
    }

    /// Build the engine against an explicit clock; tests drive time with a
    /// [`crate::clock::ManualClock`]
    pub fn with_clock(
        config: ResilienceConfig,
        adapters: Arc<AdapterRegistry>,
        cache: Arc<dyn FallbackCache>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let source_service = config.coordinator.source_service.clone();
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            Arc::clone(&clock),
        ));
        let incidents = Arc::new(IncidentLog::new(
            Arc::clone(&sink),
            Arc::clone(&clock),
            source_service.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            config.prediction.clone(),
            Arc::clone(&adapters),
            Arc::clone(&breakers),
            Arc::clone(&incidents),
            Arc::clone(&sink),
            Arc::clone(&clock),
            source_service,
        ));
        let strategies = Arc::new(StrategyRegistry::new(Arc::clone(&clock)));

        Self {
            config,
            strategies,
            breakers,
            health,
            adapters,
            cache,
            incidents,
            sink,
            clock,
            refreshing: Arc::new(DashSet::new()),
        }
    }

    pub fn strategies(&self) -> Arc<StrategyRegistry> {
        Arc::clone(&self.strategies)
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    pub fn incidents(&self) -> Arc<IncidentLog> {
        Arc::clone(&self.incidents)
    }

    /// Read-only topology view over health records and breaker states
    pub fn mesh(&self) -> ServiceMeshAggregator {
        ServiceMeshAggregator::new(Arc::clone(&self.health), Arc::clone(&self.breakers))
    }

    /// Topology headline snapshot (see [`ServiceMeshAggregator::status`])
    pub fn service_mesh_status(&self) -> crate::models::ServiceMeshStatus {
        self.mesh().status()
    }

    /// Per-breaker state snapshot
    pub fn circuit_breaker_status(&self) -> Vec<crate::circuit_breaker::BreakerSnapshot> {
        self.mesh().circuit_breakers()
    }

    /// Every health record the monitor holds
    pub fn detailed_health(&self) -> Vec<crate::models::HealthRecord> {
        self.mesh().detailed_health()
    }

    // ------------------------------------------------------------------
    // Strategy administration
    // ------------------------------------------------------------------

    /// Register a strategy and wire its providers into monitoring
    pub fn register_strategy(&self, request: RegisterStrategyRequest) -> Result<FallbackStrategy> {
        let strategy = self.strategies.register(request)?;
        for provider in &strategy.providers {
            self.health
                .watch_provider(&strategy.service, &provider.id, strategy.business_criticality);
            self.breakers.breaker(&strategy.service, &provider.id);
        }
        Ok(strategy)
    }

    /// Apply a partial update; provider watch-lists follow the change
    pub fn update_strategy(
        &self,
        service: &str,
        request: UpdateStrategyRequest,
    ) -> Result<FallbackStrategy> {
        let before = self.strategies.get(service)?;
        let updated = self.strategies.update(service, request)?;

        for provider in &updated.providers {
            self.health
                .watch_provider(service, &provider.id, updated.business_criticality);
            self.breakers.breaker(service, &provider.id);
        }
        for old in &before.providers {
            if !updated.providers.iter().any(|p| p.id == old.id) {
                self.health.unwatch_provider(service, &old.id);
            }
        }
        Ok(updated)
    }

    pub fn remove_strategy(&self, service: &str) -> Result<FallbackStrategy> {
        let removed = self.strategies.remove(service)?;
        self.health.unwatch_service(service);
        self.breakers.remove_service(service);
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    /// Aggregated health, optionally filtered to one service
    pub fn get_health_status(&self, service: Option<&str>) -> Result<HealthStatusReport> {
        let all = self.strategies.health_status(&self.health);
        let services = match service {
            Some(name) => {
                let summary = all
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ResilienceError::StrategyNotFound(name.to_string()))?;
                HashMap::from([(name.to_string(), summary)])
            }
            None => all,
        };
        let overall = services
            .values()
            .map(|summary| summary.status)
            .max()
            .unwrap_or(HealthState::Healthy);
        Ok(HealthStatusReport { overall, services })
    }

    /// Probe every provider of a service now and reconcile its incident
    pub async fn trigger_manual_health_check(&self, service: &str) -> Result<ManualCheckOutcome> {
        let strategy = self.require_strategy(service)?;
        let records = self.health.check_service_now(service).await;

        let worst = records.iter().map(|record| record.status).max();
        let incident = match worst {
            Some(state) if state > HealthState::Healthy => {
                let degraded = records
                    .iter()
                    .filter(|record| record.status > HealthState::Healthy)
                    .count();
                let (incident_type, severity) = match state {
                    HealthState::Degraded => (IncidentType::Degradation, IncidentSeverity::Medium),
                    HealthState::Unhealthy => (IncidentType::ErrorSpike, IncidentSeverity::High),
                    _ => (IncidentType::Outage, IncidentSeverity::Critical),
                };
                Some(self.incidents.open(
                    service,
                    None,
                    incident_type,
                    severity,
                    format!(
                        "manual health check: {} of {} providers not healthy",
                        degraded,
                        records.len()
                    ),
                    Self::impact_of(&strategy),
                ))
            }
            // All healthy: close the service-scoped incident if one is open
            _ => self
                .incidents
                .resolve(service, None, IncidentResolution::AutoRecovered),
        };

        Ok(ManualCheckOutcome { records, incident })
    }

    /// Operator-forced fallback, e.g. ahead of announced vendor maintenance
    pub fn trigger_manual_fallback(&self, service: &str, reason: &str) -> Result<Incident> {
        let strategy = self.require_strategy(service)?;
        info!(service, reason, "manual fallback triggered");
        Ok(self.incidents.open(
            service,
            None,
            IncidentType::Degradation,
            IncidentSeverity::Medium,
            format!("manual fallback triggered: {}", reason),
            Self::impact_of(&strategy),
        ))
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Execute one operation with graduated fallback
    pub async fn execute(
        &self,
        service: &str,
        operation: OperationKind,
        params: Value,
        ctx: &BusinessContext,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let started = self.clock.now();
        let plan = self.plan(service, operation, ctx)?;
        let mut result = ExecutionResult::empty(service, operation);

        if let Some((provider, required_pct)) = &plan.budget_exceeded {
            return Ok(self.finish(
                self.budget_exceeded_result(result, provider, *required_pct),
                started,
                options,
            ));
        }

        let overall_budget = options.deadline_ms.map(Duration::from_millis);
        let mut failures: Vec<(String, ProviderFailure)> = Vec::new();
        let mut deadline_hit = false;

        for provider in &plan.candidates {
            let elapsed = self.clock.now().duration_since(started);
            if let Some(budget) = overall_budget {
                if elapsed >= budget {
                    deadline_hit = true;
                    break;
                }
            }

            let adapter = match self.adapters.get(&provider.id) {
                Some(adapter) => adapter,
                None => {
                    // Misconfiguration, not a vendor failure: skip without
                    // touching the breaker
                    warn!(service, provider = %provider.id, "no adapter registered");
                    result.attempts.push(AttemptRecord {
                        provider: provider.id.clone(),
                        succeeded: false,
                        error: Some("no adapter registered".to_string()),
                        latency_ms: None,
                    });
                    continue;
                }
            };

            let breaker = self.breakers.breaker(service, &provider.id);
            if !breaker.allow() {
                result.attempts.push(AttemptRecord {
                    provider: provider.id.clone(),
                    succeeded: false,
                    error: Some("circuit breaker open".to_string()),
                    latency_ms: None,
                });
                continue;
            }

            let per_call = self.per_call_timeout(provider, &plan.strategy, ctx, overall_budget, elapsed);
            let request = OperationRequest {
                operation,
                params: params.clone(),
            };

            let outcome = match timeout(per_call, adapter.invoke(&request, per_call)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(failure)) => Err(failure),
                Err(_) => Err(ProviderFailure::Timeout(per_call)),
            };

            match outcome {
                Ok(response) => {
                    breaker.record_success();
                    self.health
                        .observe_call(service, &provider.id, Ok(response.latency));

                    result.attempts.push(AttemptRecord {
                        provider: provider.id.clone(),
                        succeeded: true,
                        error: None,
                        latency_ms: Some(response.latency.as_millis() as u64),
                    });
                    result.success = true;
                    result.provider = Some(provider.id.clone());
                    result.degradation = Self::rank_degradation(&plan, &provider.id);
                    result.cost_impact_percent =
                        Self::cost_impact(plan.cheapest_cost, response.cost);
                    result.payload = Some(response.payload.clone());

                    if let Some(cache_cfg) = &plan.strategy.cache {
                        let key = cache_key(service, operation, &params);
                        self.cache
                            .put(&key, response.payload, self.cache_ttl(cache_cfg))
                            .await;
                    }

                    debug!(
                        service,
                        provider = %provider.id,
                        degradation = ?result.degradation,
                        "execution served by provider"
                    );
                    return Ok(self.finish(result, started, options));
                }
                Err(failure) => {
                    breaker.record_failure();
                    self.health.observe_call(service, &provider.id, Err(&failure));
                    warn!(
                        service,
                        provider = %provider.id,
                        error = %failure,
                        "provider attempt failed, advancing to next candidate"
                    );
                    result.attempts.push(AttemptRecord {
                        provider: provider.id.clone(),
                        succeeded: false,
                        error: Some(failure.to_string()),
                        latency_ms: None,
                    });
                    failures.push((provider.id.clone(), failure));
                }
            }
        }

        if deadline_hit {
            result.recommendations.push(
                "caller deadline exhausted before every candidate was tried; raise deadline_ms \
                 or max_latency_increase_ms"
                    .to_string(),
            );
        }

        let result = self
            .fallback_tiers(&plan.strategy, operation, &params, result, &failures)
            .await;
        Ok(self.finish(result, started, options))
    }

    /// Batch variant for matrix-style operations
    ///
    /// One provider decision covers the whole batch; a partial success is
    /// still a success, with the degradation level reflecting the missing
    /// fraction.
    pub async fn execute_batch(
        &self,
        service: &str,
        operation: OperationKind,
        items: Vec<Value>,
        ctx: &BusinessContext,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let started = self.clock.now();
        let plan = self.plan(service, operation, ctx)?;
        let batch_params = Value::Array(items.clone());
        let mut result = ExecutionResult::empty(service, operation);

        if let Some((provider, required_pct)) = &plan.budget_exceeded {
            return Ok(self.finish(
                self.budget_exceeded_result(result, provider, *required_pct),
                started,
                options,
            ));
        }

        let overall_budget = options.deadline_ms.map(Duration::from_millis);
        let mut failures: Vec<(String, ProviderFailure)> = Vec::new();

        for provider in &plan.candidates {
            let elapsed = self.clock.now().duration_since(started);
            if let Some(budget) = overall_budget {
                if elapsed >= budget {
                    break;
                }
            }

            let adapter = match self.adapters.get(&provider.id) {
                Some(adapter) => adapter,
                None => continue,
            };
            let breaker = self.breakers.breaker(service, &provider.id);
            if !breaker.allow() {
                continue;
            }

            let per_call = self.per_call_timeout(provider, &plan.strategy, ctx, overall_budget, elapsed);
            let outcome = match timeout(
                per_call,
                adapter.invoke_batch(operation, &items, per_call),
            )
            .await
            {
                Ok(Ok(batch)) => Ok(batch),
                Ok(Err(failure)) => Err(failure),
                Err(_) => Err(ProviderFailure::Timeout(per_call)),
            };

            match outcome {
                Ok(batch) if batch.resolved() > 0 => {
                    breaker.record_success();
                    self.health
                        .observe_call(service, &provider.id, Ok(batch.latency));

                    let resolved = batch.resolved();
                    let total = items.len().max(1);
                    let missing_fraction = 1.0 - resolved as f64 / total as f64;

                    result.attempts.push(AttemptRecord {
                        provider: provider.id.clone(),
                        succeeded: true,
                        error: None,
                        latency_ms: Some(batch.latency.as_millis() as u64),
                    });
                    result.success = true;
                    result.provider = Some(provider.id.clone());
                    result.degradation = Self::rank_degradation(&plan, &provider.id)
                        .max(Self::fraction_degradation(missing_fraction));
                    result.cost_impact_percent =
                        Self::cost_impact(plan.cheapest_cost * total as f64, batch.cost);
                    result
                        .metadata
                        .insert("resolved".to_string(), json!(resolved));
                    result.metadata.insert("total".to_string(), json!(total));
                    let payload = Value::Array(
                        batch
                            .items
                            .into_iter()
                            .map(|item| item.unwrap_or(Value::Null))
                            .collect(),
                    );
                    result.payload = Some(payload.clone());

                    if let Some(cache_cfg) = &plan.strategy.cache {
                        let key = cache_key(service, operation, &batch_params);
                        self.cache.put(&key, payload, self.cache_ttl(cache_cfg)).await;
                    }
                    return Ok(self.finish(result, started, options));
                }
                Ok(_) => {
                    // A batch with nothing resolved is a provider failure
                    let failure =
                        ProviderFailure::Malformed("batch resolved no items".to_string());
                    breaker.record_failure();
                    self.health.observe_call(service, &provider.id, Err(&failure));
                    result.attempts.push(AttemptRecord {
                        provider: provider.id.clone(),
                        succeeded: false,
                        error: Some(failure.to_string()),
                        latency_ms: None,
                    });
                    failures.push((provider.id.clone(), failure));
                }
                Err(failure) => {
                    breaker.record_failure();
                    self.health.observe_call(service, &provider.id, Err(&failure));
                    result.attempts.push(AttemptRecord {
                        provider: provider.id.clone(),
                        succeeded: false,
                        error: Some(failure.to_string()),
                        latency_ms: None,
                    });
                    failures.push((provider.id.clone(), failure));
                }
            }
        }

        let result = self
            .fallback_tiers(&plan.strategy, operation, &batch_params, result, &failures)
            .await;
        Ok(self.finish(result, started, options))
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    /// Resolve the strategy and rank the admissible candidates
    fn plan(
        &self,
        service: &str,
        operation: OperationKind,
        ctx: &BusinessContext,
    ) -> Result<ExecutionPlan> {
        let strategy = self.require_strategy(service)?;

        let by_priority: Vec<ProviderConfig> = strategy
            .providers_by_priority()
            .into_iter()
            .filter(|provider| provider.supports(operation))
            .collect();
        if by_priority.is_empty() {
            return Err(ResilienceError::Configuration(format!(
                "no provider of service {} supports operation {}",
                service, operation
            )));
        }

        let priority_rank: HashMap<String, usize> = by_priority
            .iter()
            .enumerate()
            .map(|(index, provider)| (provider.id.clone(), index))
            .collect();
        let cheapest_cost = by_priority
            .iter()
            .map(|provider| provider.cost_per_request)
            .fold(f64::INFINITY, f64::min);

        // Business-context bias: critical traffic chases availability,
        // everything else chases cost. Stable sorts keep the priority
        // order as the tie-breaker.
        let mut ordered = by_priority;
        if ctx.is_critical_path() {
            ordered.sort_by(|a, b| {
                let availability = |p: &ProviderConfig| {
                    self.health
                        .record(service, &p.id)
                        .map(|record| record.availability)
                        .unwrap_or(1.0)
                };
                availability(b)
                    .partial_cmp(&availability(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            let preferred: HashSet<String> = strategy
                .cost
                .as_ref()
                .map(|c| c.preferred_providers.iter().cloned().collect())
                .unwrap_or_default();
            ordered.sort_by(|a, b| {
                a.cost_per_request
                    .partial_cmp(&b.cost_per_request)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        preferred
                            .contains(&b.id)
                            .cmp(&preferred.contains(&a.id))
                    })
            });
        }

        let live: Vec<ProviderConfig> = ordered
            .into_iter()
            .filter(|provider| {
                self.breakers
                    .breaker(service, &provider.id)
                    .is_available()
            })
            .collect();

        let max_increase = ctx
            .max_cost_increase_percent
            .or(strategy.cost.as_ref().map(|c| c.max_cost_increase_percent));

        let (candidates, budget_exceeded) = match max_increase {
            Some(pct) if !live.is_empty() => {
                let ceiling = cheapest_cost * (1.0 + pct / 100.0) + f64::EPSILON;
                let in_budget: Vec<ProviderConfig> = live
                    .iter()
                    .filter(|provider| provider.cost_per_request <= ceiling)
                    .cloned()
                    .collect();
                if in_budget.is_empty() {
                    // Cheapest live candidate and the increase that would
                    // admit it; priced-out candidates are NOT failures
                    let cheapest_live = live
                        .iter()
                        .min_by(|a, b| {
                            a.cost_per_request
                                .partial_cmp(&b.cost_per_request)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .expect("live is non-empty");
                    let required =
                        (cheapest_live.cost_per_request / cheapest_cost - 1.0) * 100.0;
                    (Vec::new(), Some((cheapest_live.id.clone(), required)))
                } else {
                    (in_budget, None)
                }
            }
            _ => (live, None),
        };

        Ok(ExecutionPlan {
            strategy,
            candidates,
            priority_rank,
            cheapest_cost,
            budget_exceeded,
        })
    }

    fn per_call_timeout(
        &self,
        provider: &ProviderConfig,
        strategy: &FallbackStrategy,
        ctx: &BusinessContext,
        overall_budget: Option<Duration>,
        elapsed: Duration,
    ) -> Duration {
        let mut per_call = Duration::from_millis(
            provider.timeout_ms.unwrap_or(strategy.default_timeout_ms),
        );
        if let Some(max_latency_ms) = ctx.max_latency_increase_ms {
            per_call = per_call.min(Duration::from_millis(max_latency_ms));
        }
        if let Some(budget) = overall_budget {
            per_call = per_call.min(budget.saturating_sub(elapsed));
        }
        per_call
    }

    fn rank_degradation(plan: &ExecutionPlan, provider_id: &str) -> DegradationLevel {
        match plan.priority_rank.get(provider_id).copied().unwrap_or(0) {
            0 => DegradationLevel::None,
            1 => DegradationLevel::Minor,
            _ => DegradationLevel::Moderate,
        }
    }

    fn fraction_degradation(missing_fraction: f64) -> DegradationLevel {
        if missing_fraction <= f64::EPSILON {
            DegradationLevel::None
        } else if missing_fraction <= 0.25 {
            DegradationLevel::Minor
        } else if missing_fraction <= 0.5 {
            DegradationLevel::Moderate
        } else {
            DegradationLevel::Severe
        }
    }

    fn cost_impact(baseline: f64, actual: f64) -> f64 {
        if baseline <= 0.0 || !baseline.is_finite() {
            return 0.0;
        }
        (actual - baseline) / baseline * 100.0
    }

    // ------------------------------------------------------------------
    // Fallback tiers
    // ------------------------------------------------------------------

    async fn fallback_tiers(
        &self,
        strategy: &FallbackStrategy,
        operation: OperationKind,
        params: &Value,
        mut result: ExecutionResult,
        failures: &[(String, ProviderFailure)],
    ) -> ExecutionResult {
        let service = result.service.clone();

        // Tier 1: cache, for any cache-enabled strategy
        if let Some(cache_cfg) = &strategy.cache {
            let key = cache_key(&service, operation, params);
            if let Some(entry) = self.cache.get(&key).await {
                let max_age = Duration::from_secs(cache_cfg.max_age_seconds);
                if entry.age <= max_age {
                    info!(service, age_secs = entry.age.as_secs(), "serving cached fallback");
                    result.success = true;
                    result.cache_used = true;
                    result.degradation = DegradationLevel::Moderate;
                    result.payload = Some(entry.value);
                    result
                        .metadata
                        .insert("cache_age_seconds".to_string(), json!(entry.age.as_secs()));
                    return result;
                }
                if cache_cfg.stale_while_revalidate {
                    info!(
                        service,
                        age_secs = entry.age.as_secs(),
                        "serving stale cache entry, scheduling refresh"
                    );
                    self.schedule_refresh(&service, operation, params.clone(), key);
                    result.success = true;
                    result.cache_used = true;
                    result.degradation = DegradationLevel::Severe;
                    result.payload = Some(entry.value);
                    result
                        .metadata
                        .insert("cache_age_seconds".to_string(), json!(entry.age.as_secs()));
                    result.metadata.insert("stale".to_string(), json!(true));
                    return result;
                }
            }
        }

        // Tier 2: degraded functionality
        if matches!(
            strategy.strategy_type,
            StrategyType::DegradedFunctionality | StrategyType::HybridApproach
        ) {
            if let Some(degraded) = &strategy.degraded {
                info!(service, "serving degraded functionality");
                result.success = true;
                result.degradation = DegradationLevel::Severe;
                result.offline_mode = false;
                result.payload = degraded.fallback_data.clone();
                result.metadata.insert(
                    "user_message".to_string(),
                    json!(degraded.user_message.clone()),
                );
                result.metadata.insert(
                    "disabled_features".to_string(),
                    json!(degraded.disabled_features.clone()),
                );
                return result;
            }
        }

        // Tier 3: manual operation
        if strategy.strategy_type == StrategyType::ManualOperation {
            if let Some(manual) = &strategy.manual {
                warn!(service, "falling back to manual operation");
                result.success = false;
                result.degradation = DegradationLevel::Offline;
                result.offline_mode = true;
                result.metadata.insert(
                    "escalation_path".to_string(),
                    json!(manual.escalation_path.clone()),
                );
                result.metadata.insert(
                    "estimated_resolution_minutes".to_string(),
                    json!(manual.estimated_resolution_minutes),
                );
                if let Some(instructions) = &manual.instructions {
                    result
                        .metadata
                        .insert("instructions".to_string(), json!(instructions.clone()));
                }
                result.recommendations.push(format!(
                    "providers exhausted; escalate via {} (estimated resolution {} minutes)",
                    manual.escalation_path, manual.estimated_resolution_minutes
                ));
                return result;
            }
        }

        // Every tier failed
        warn!(service, attempts = result.attempts.len(), "fallback exhausted");
        result.success = false;
        result.degradation = DegradationLevel::Offline;
        result.offline_mode = true;
        result
            .metadata
            .insert("reason".to_string(), json!("fallback_exhausted"));
        result.metadata.insert(
            "error".to_string(),
            json!(ResilienceError::FallbackExhausted(service.clone()).to_string()),
        );
        let mut seen = HashSet::new();
        for (provider, failure) in failures {
            let recommendation = failure.recommendation(provider);
            if seen.insert(recommendation.clone()) {
                result.recommendations.push(recommendation);
            }
        }
        if strategy.cache.is_none() {
            result.recommendations.push(format!(
                "consider enabling a cache fallback for service {}",
                service
            ));
        }
        result
    }

    /// Deduplicated background refresh behind stale-while-revalidate
    fn schedule_refresh(&self, service: &str, operation: OperationKind, params: Value, key: String) {
        if !self.refreshing.insert(key.clone()) {
            return;
        }
        let coordinator = self.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            coordinator
                .refresh_cache(&service, operation, params, &key)
                .await;
            coordinator.refreshing.remove(&key);
        });
    }

    /// One best-effort pass over the candidates to repopulate a stale key
    async fn refresh_cache(&self, service: &str, operation: OperationKind, params: Value, key: &str) {
        debug!(service, key, "background cache refresh");
        let strategy = match self.strategies.get(service) {
            Ok(strategy) => strategy,
            Err(_) => return,
        };
        let Some(cache_cfg) = strategy.cache.clone() else {
            return;
        };

        for provider in strategy
            .providers_by_priority()
            .iter()
            .filter(|p| p.supports(operation))
        {
            let Some(adapter) = self.adapters.get(&provider.id) else {
                continue;
            };
            let breaker = self.breakers.breaker(service, &provider.id);
            if !breaker.allow() {
                continue;
            }

            let per_call =
                Duration::from_millis(provider.timeout_ms.unwrap_or(strategy.default_timeout_ms));
            let request = OperationRequest {
                operation,
                params: params.clone(),
            };
            match timeout(per_call, adapter.invoke(&request, per_call)).await {
                Ok(Ok(response)) => {
                    breaker.record_success();
                    self.health
                        .observe_call(service, &provider.id, Ok(response.latency));
                    self.cache
                        .put(key, response.payload, self.cache_ttl(&cache_cfg))
                        .await;
                    debug!(service, provider = %provider.id, "cache refreshed");
                    return;
                }
                Ok(Err(failure)) => {
                    breaker.record_failure();
                    self.health.observe_call(service, &provider.id, Err(&failure));
                }
                Err(_) => {
                    let failure = ProviderFailure::Timeout(per_call);
                    breaker.record_failure();
                    self.health.observe_call(service, &provider.id, Err(&failure));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn require_strategy(&self, service: &str) -> Result<FallbackStrategy> {
        self.strategies.get(service).map_err(|_| {
            ResilienceError::Configuration(format!(
                "no fallback strategy registered for service: {}",
                service
            ))
        })
    }

    fn impact_of(strategy: &FallbackStrategy) -> ImpactLevel {
        strategy
            .continuity
            .as_ref()
            .map(|c| c.impact_level)
            .unwrap_or(ImpactLevel::Medium)
    }

    fn cache_ttl(&self, cache_cfg: &crate::models::CacheStrategy) -> Duration {
        let factor = if cache_cfg.stale_while_revalidate {
            self.config.cache.stale_retention_factor as u64
        } else {
            1
        };
        Duration::from_secs(cache_cfg.max_age_seconds.saturating_mul(factor))
    }

    fn budget_exceeded_result(
        &self,
        mut result: ExecutionResult,
        cheapest_live_provider: &str,
        required_pct: f64,
    ) -> ExecutionResult {
        warn!(
            service = %result.service,
            provider = cheapest_live_provider,
            required_pct,
            "no candidate within cost budget"
        );
        result.success = false;
        result
            .metadata
            .insert("reason".to_string(), json!("budget_exceeded"));
        result.metadata.insert(
            "error".to_string(),
            json!(ResilienceError::BudgetExceeded(result.service.clone()).to_string()),
        );
        result.recommendations.push(format!(
            "raise max_cost_increase_percent to at least {:.0}% to admit provider {}",
            required_pct.ceil(),
            cheapest_live_provider
        ));
        result
    }

    /// Stamp the total latency and emit the execution event
    fn finish(
        &self,
        mut result: ExecutionResult,
        started: Instant,
        options: &ExecutionOptions,
    ) -> ExecutionResult {
        result.latency_ms = self.clock.now().duration_since(started).as_millis() as u64;

        let mut metadata = EventMetadata::new(self.config.coordinator.source_service.clone());
        if let Some(correlation_id) = options.correlation_id {
            metadata = metadata.with_correlation(correlation_id);
        }
        self.sink.emit(
            metadata,
            ResilienceEvent::FallbackExecuted {
                service: result.service.clone(),
                operation: result.operation,
                provider: result.provider.clone(),
                success: result.success,
                degradation: result.degradation,
                cache_used: result.cache_used,
                offline_mode: result.offline_mode,
                latency_ms: result.latency_ms,
                cost_impact_percent: result.cost_impact_percent,
            },
        );
        result
    }
}

/// Stable cache key over service, operation, and request params
fn cache_key(service: &str, operation: OperationKind, params: &Value) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    params.to_string().hash(&mut hasher);
    format!("{}:{}:{:016x}", service, operation, hasher.finish())
}
