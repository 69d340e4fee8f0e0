//! Fallback Strategy Registry
//!
//! Operator-managed table of per-service fallback policies. Payloads are
//! checked with `validator` rules plus the cross-field rules the derive
//! cannot express (a cache-driven strategy needs a cache section, a
//! manual-operation strategy needs an escalation path). Reads happen on
//! every coordination decision, so strategies are kept in a `DashMap` and
//! returned by value.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use validator::Validate;

use crate::clock::Clock;
use crate::health::HealthMonitor;
use crate::models::{
    CacheStrategy, FallbackStrategy, HealthState, ManualOperation, ProviderConfig,
    RegisterStrategyRequest, ServiceHealthSummary, StrategyType, UpdateStrategyRequest,
};
use crate::{coordinator_defaults, ResilienceError, Result};

/// Registry of fallback strategies keyed by service name
pub struct StrategyRegistry {
    strategies: DashMap<String, FallbackStrategy>,
    clock: Arc<dyn Clock>,
}

impl StrategyRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            strategies: DashMap::new(),
            clock,
        }
    }

    /// Register (or replace) the strategy for a service
    pub fn register(&self, request: RegisterStrategyRequest) -> Result<FallbackStrategy> {
        request
            .validate()
            .map_err(|e| ResilienceError::validation("strategy", e.to_string()))?;
        validate_strategy_rules(
            request.strategy_type,
            &request.providers,
            request.cache.as_ref(),
            request.manual.as_ref(),
        )?;

        let now = self.clock.timestamp();
        let strategy = FallbackStrategy {
            service: request.service.clone(),
            business_criticality: request.business_criticality,
            strategy_type: request.strategy_type,
            providers: request.providers,
            cache: request.cache,
            degraded: request.degraded,
            manual: request.manual,
            continuity: request.continuity,
            cost: request.cost,
            default_timeout_ms: request
                .default_timeout_ms
                .unwrap_or(coordinator_defaults::DEFAULT_TIMEOUT_MS),
            created_at: now,
            updated_at: now,
        };

        let replaced = self
            .strategies
            .insert(request.service.clone(), strategy.clone())
            .is_some();
        info!(
            service = %request.service,
            strategy_type = ?strategy.strategy_type,
            providers = strategy.providers.len(),
            replaced,
            "fallback strategy registered"
        );

        Ok(strategy)
    }

    /// Apply a partial update to a registered strategy
    pub fn update(&self, service: &str, request: UpdateStrategyRequest) -> Result<FallbackStrategy> {
        request
            .validate()
            .map_err(|e| ResilienceError::validation("strategy", e.to_string()))?;

        let mut entry = self
            .strategies
            .get_mut(service)
            .ok_or_else(|| ResilienceError::StrategyNotFound(service.to_string()))?;

        let mut merged = entry.clone();
        if let Some(criticality) = request.business_criticality {
            merged.business_criticality = criticality;
        }
        if let Some(strategy_type) = request.strategy_type {
            merged.strategy_type = strategy_type;
        }
        if let Some(providers) = request.providers {
            merged.providers = providers;
        }
        if let Some(cache) = request.cache {
            merged.cache = Some(cache);
        }
        if let Some(degraded) = request.degraded {
            merged.degraded = Some(degraded);
        }
        if let Some(manual) = request.manual {
            merged.manual = Some(manual);
        }
        if let Some(continuity) = request.continuity {
            merged.continuity = Some(continuity);
        }
        if let Some(cost) = request.cost {
            merged.cost = Some(cost);
        }
        if let Some(timeout_ms) = request.default_timeout_ms {
            merged.default_timeout_ms = timeout_ms;
        }

        validate_strategy_rules(
            merged.strategy_type,
            &merged.providers,
            merged.cache.as_ref(),
            merged.manual.as_ref(),
        )?;

        merged.updated_at = self.clock.timestamp();
        *entry = merged.clone();
        debug!(service, "fallback strategy updated");

        Ok(merged)
    }

    /// Remove a strategy; returns the removed entry
    pub fn remove(&self, service: &str) -> Result<FallbackStrategy> {
        let (_, strategy) = self
            .strategies
            .remove(service)
            .ok_or_else(|| ResilienceError::StrategyNotFound(service.to_string()))?;
        info!(service, "fallback strategy removed");
        Ok(strategy)
    }

    pub fn get(&self, service: &str) -> Result<FallbackStrategy> {
        self.strategies
            .get(service)
            .map(|s| s.clone())
            .ok_or_else(|| ResilienceError::StrategyNotFound(service.to_string()))
    }

    pub fn contains(&self, service: &str) -> bool {
        self.strategies.contains_key(service)
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> =
            self.strategies.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Per-service provider health summary for dashboards
    pub fn health_status(&self, health: &HealthMonitor) -> HashMap<String, ServiceHealthSummary> {
        self.strategies
            .iter()
            .map(|entry| {
                let strategy = entry.value();
                let mut healthy = 0u32;
                let mut best = None;
                for provider in &strategy.providers {
                    let state = health
                        .record(&strategy.service, &provider.id)
                        .map(|record| record.status)
                        // Not yet observed counts as healthy, matching the
                        // record's initial state
                        .unwrap_or(HealthState::Healthy);
                    if state == HealthState::Healthy {
                        healthy += 1;
                    }
                    best = Some(match best {
                        Some(current) if current <= state => current,
                        _ => state,
                    });
                }

                (
                    strategy.service.clone(),
                    ServiceHealthSummary {
                        service: strategy.service.clone(),
                        business_criticality: strategy.business_criticality,
                        strategy_type: strategy.strategy_type,
                        healthy_providers: healthy,
                        total_providers: strategy.providers.len() as u32,
                        status: best.unwrap_or(HealthState::Healthy),
                    },
                )
            })
            .collect()
    }
}

/// Cross-field rules the `validator` derive cannot express
fn validate_strategy_rules(
    strategy_type: StrategyType,
    providers: &[ProviderConfig],
    cache: Option<&CacheStrategy>,
    manual: Option<&ManualOperation>,
) -> Result<()> {
    if providers.is_empty() {
        return Err(ResilienceError::validation(
            "providers",
            "at least one provider is required",
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for provider in providers {
        if !seen.insert(provider.id.as_str()) {
            return Err(ResilienceError::validation(
                "providers",
                format!("duplicate provider id: {}", provider.id),
            ));
        }
        if provider.capabilities.is_empty() {
            return Err(ResilienceError::validation(
                "providers",
                format!("provider {} declares no capabilities", provider.id),
            ));
        }
    }

    match strategy_type {
        StrategyType::CacheOnly | StrategyType::HybridApproach => {
            if cache.is_none() {
                return Err(ResilienceError::validation(
                    "cache",
                    "cache-driven strategies require a cache section",
                ));
            }
        }
        StrategyType::ManualOperation => match manual {
            Some(manual) if !manual.escalation_path.trim().is_empty() => {}
            _ => {
                return Err(ResilienceError::validation(
                    "manual",
                    "manual operation strategies require a non-empty escalation path",
                ));
            }
        },
        _ => {}
    }

    Ok(())
}
