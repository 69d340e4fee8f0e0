//! Event schema definitions for the FIELDOPS Platform
//!
//! The resilience engine holds only in-memory state for active decisions;
//! everything worth keeping (incident history, fallback executions, SLA
//! inputs) leaves the engine as one of these immutable records. The
//! persistence collaborator stores them; dashboards and reports read them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::core::*;

/// Metadata stamped on every emitted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub source_service: String,
    pub source_version: String,
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(source_service: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source_service: source_service.into(),
            source_version: env!("CARGO_PKG_VERSION").to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// How an incident was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentResolution {
    /// Health recovered and the incident auto-closed
    AutoRecovered,
    /// An operator resolved the incident explicitly
    ManuallyResolved,
}

/// Events emitted by the resilience engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
#[serde(rename_all = "snake_case")]
pub enum ResilienceEvent {
    IncidentOpened {
        incident_id: Uuid,
        service: String,
        provider: Option<String>,
        incident_type: IncidentType,
        severity: IncidentSeverity,
        description: String,
        business_impact: ImpactLevel,
        opened_at: DateTime<Utc>,
    },
    IncidentClosed {
        incident_id: Uuid,
        service: String,
        resolution: IncidentResolution,
        opened_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    },
    FallbackExecuted {
        service: String,
        operation: OperationKind,
        provider: Option<String>,
        success: bool,
        degradation: DegradationLevel,
        cache_used: bool,
        offline_mode: bool,
        latency_ms: u64,
        cost_impact_percent: f64,
    },
    FailurePredicted {
        service: String,
        provider: String,
        failure_probability: f64,
        recommendation: String,
    },
}

impl ResilienceEvent {
    /// Service the event concerns, for routing/partitioning downstream
    pub fn service(&self) -> &str {
        match self {
            ResilienceEvent::IncidentOpened { service, .. } => service,
            ResilienceEvent::IncidentClosed { service, .. } => service,
            ResilienceEvent::FallbackExecuted { service, .. } => service,
            ResilienceEvent::FailurePredicted { service, .. } => service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = ResilienceEvent::FallbackExecuted {
            service: "routing".to_string(),
            operation: OperationKind::Route,
            provider: Some("vendor-a".to_string()),
            success: true,
            degradation: DegradationLevel::Minor,
            cache_used: false,
            offline_mode: false,
            latency_ms: 240,
            cost_impact_percent: 12.5,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "fallback_executed");
        assert_eq!(json["degradation"], "minor");
        assert_eq!(event.service(), "routing");
    }

    #[test]
    fn test_event_round_trip() {
        let event = ResilienceEvent::FailurePredicted {
            service: "geocoding".to_string(),
            provider: "vendor-b".to_string(),
            failure_probability: 0.82,
            recommendation: "switch strategy before the provider trips".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        let back: ResilienceEvent = serde_json::from_str(&json).unwrap();
        match back {
            ResilienceEvent::FailurePredicted {
                failure_probability,
                ..
            } => assert!((failure_probability - 0.82).abs() < f64::EPSILON),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_metadata_correlation() {
        let correlation = Uuid::new_v4();
        let meta = EventMetadata::new("resilience-coordinator").with_correlation(correlation);
        assert_eq!(meta.correlation_id, Some(correlation));
        assert_eq!(meta.source_service, "resilience-coordinator");
    }
}
