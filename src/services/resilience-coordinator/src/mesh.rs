//! Service Mesh Status Aggregation
//!
//! Read-only view combining health records and circuit breaker states into
//! topology snapshots for dashboards and incident summaries. Computed on
//! demand, never mutates engine state, and returns identical snapshots for
//! identical underlying state.

use std::sync::Arc;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
use crate::health::HealthMonitor;
use crate::models::{HealthRecord, HealthState, ServiceMeshStatus};

/// Read-only aggregator over the health monitor and breaker registry
pub struct ServiceMeshAggregator {
    health: Arc<HealthMonitor>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ServiceMeshAggregator {
    pub fn new(health: Arc<HealthMonitor>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { health, breakers }
    }

    /// Topology headline: node counts and open breakers
    pub fn status(&self) -> ServiceMeshStatus {
        let records = self.health.records();
        let healthy = records
            .iter()
            .filter(|record| record.status == HealthState::Healthy)
            .count();

        ServiceMeshStatus {
            total_nodes: records.len() as u32,
            healthy_nodes: healthy as u32,
            open_circuit_breakers: self.breakers.open_count() as u32,
        }
    }

    /// Every health record, sorted by service then provider
    pub fn detailed_health(&self) -> Vec<HealthRecord> {
        self.health.records()
    }

    /// Every breaker state, sorted by service then provider
    pub fn circuit_breakers(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// Breakers currently refusing traffic
    pub fn open_breakers(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .snapshots()
            .into_iter()
            .filter(|snapshot| snapshot.state == CircuitState::Open)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, ProviderFailure};
    use crate::clock::{Clock, ManualClock};
    use crate::config::{CircuitBreakerConfig, HealthConfig, PredictionConfig};
    use crate::incident::{EventSink, IncidentLog, NoopEventSink};
    use fieldops_shared::BusinessCriticality;
    use std::time::Duration;

    fn aggregator() -> ServiceMeshAggregator {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let sink: Arc<dyn EventSink> = Arc::new(NoopEventSink);
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            Arc::clone(&clock),
        ));
        let incidents = Arc::new(IncidentLog::new(
            Arc::clone(&sink),
            Arc::clone(&clock),
            "resilience-coordinator".to_string(),
        ));
        let mut health_config = HealthConfig::default();
        health_config.ewma_alpha = 1.0;
        let health = Arc::new(HealthMonitor::new(
            health_config,
            PredictionConfig::default(),
            Arc::new(AdapterRegistry::new()),
            Arc::clone(&breakers),
            incidents,
            sink,
            clock,
            "resilience-coordinator".to_string(),
        ));
        ServiceMeshAggregator::new(health, breakers)
    }

    #[test]
    fn test_status_counts_nodes_and_open_breakers() {
        let aggregator = aggregator();
        aggregator
            .health
            .watch_provider("routing", "vendor-a", BusinessCriticality::CustomerFacing);
        aggregator
            .health
            .watch_provider("routing", "vendor-b", BusinessCriticality::CustomerFacing);

        let failure = ProviderFailure::Transport("down".to_string());
        aggregator.health.observe_call("routing", "vendor-a", Err(&failure));
        for _ in 0..5 {
            aggregator.breakers.breaker("routing", "vendor-a").record_failure();
        }

        let status = aggregator.status();
        assert_eq!(status.total_nodes, 2);
        assert_eq!(status.healthy_nodes, 1);
        assert_eq!(status.open_circuit_breakers, 1);
        assert_eq!(aggregator.open_breakers().len(), 1);
    }

    #[test]
    fn test_status_is_idempotent_without_state_changes() {
        let aggregator = aggregator();
        aggregator
            .health
            .watch_provider("routing", "vendor-a", BusinessCriticality::CustomerFacing);
        aggregator
            .health
            .observe_call("routing", "vendor-a", Ok(Duration::from_millis(50)));

        let first = aggregator.status();
        let second = aggregator.status();
        assert_eq!(first, second);
        assert_eq!(aggregator.detailed_health(), aggregator.detailed_health());
        assert_eq!(aggregator.circuit_breakers(), aggregator.circuit_breakers());
    }
}
