//! Incident Lifecycle
//!
//! Incidents are the engine's durable trace of degraded service: opened by
//! the health monitor or an operator, escalated while conditions worsen,
//! closed on recovery unless held open. The engine keeps only the active
//! set in memory; every transition is emitted through [`EventSink`] for the
//! persistence collaborator to store.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fieldops_shared::{
    EventMetadata, ImpactLevel, IncidentResolution, IncidentSeverity, IncidentType,
    ResilienceEvent,
};

use crate::clock::Clock;
use crate::models::Incident;

/// Outbound event channel to the persistence collaborator
pub trait EventSink: Send + Sync {
    fn emit(&self, metadata: EventMetadata, event: ResilienceEvent);
}

/// Sink for deployments without a collaborator wired in; logs and drops
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _metadata: EventMetadata, event: ResilienceEvent) {
        debug!(service = event.service(), "dropping event, no sink configured");
    }
}

/// In-memory incident table with an open-incident index per scope
pub struct IncidentLog {
    incidents: DashMap<Uuid, Incident>,
    open_index: DashMap<(String, Option<String>), Uuid>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    source_service: String,
}

impl IncidentLog {
    pub fn new(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, source_service: String) -> Self {
        Self {
            incidents: DashMap::new(),
            open_index: DashMap::new(),
            sink,
            clock,
            source_service,
        }
    }

    /// Open an incident for a (service, provider) scope, or escalate the
    /// one already open there
    ///
    /// Escalation only moves severity upward and refreshes the
    /// description; a lower-severity report against an open incident is a
    /// no-op beyond returning the current state.
    pub fn open(
        &self,
        service: &str,
        provider: Option<&str>,
        incident_type: IncidentType,
        severity: IncidentSeverity,
        description: impl Into<String>,
        business_impact: ImpactLevel,
    ) -> Incident {
        let key = (service.to_string(), provider.map(str::to_string));
        let description = description.into();

        if let Some(existing_id) = self.open_index.get(&key).map(|id| *id) {
            if let Some(mut incident) = self.incidents.get_mut(&existing_id) {
                if severity > incident.severity {
                    warn!(
                        service,
                        provider,
                        incident_id = %existing_id,
                        from = ?incident.severity,
                        to = ?severity,
                        "escalating open incident"
                    );
                    incident.severity = severity;
                    incident.incident_type = incident_type;
                    incident.description = description;
                    if business_impact > incident.business_impact {
                        incident.business_impact = business_impact;
                    }
                }
                return incident.clone();
            }
        }

        let incident = Incident {
            id: Uuid::new_v4(),
            service: service.to_string(),
            provider: provider.map(str::to_string),
            incident_type,
            severity,
            description,
            business_impact,
            opened_at: self.clock.timestamp(),
            closed_at: None,
            hold_open: false,
        };

        info!(
            service,
            provider,
            incident_id = %incident.id,
            incident_type = ?incident_type,
            severity = ?severity,
            "incident opened"
        );

        self.incidents.insert(incident.id, incident.clone());
        self.open_index.insert(key, incident.id);

        self.sink.emit(
            EventMetadata::new(self.source_service.clone()),
            ResilienceEvent::IncidentOpened {
                incident_id: incident.id,
                service: incident.service.clone(),
                provider: incident.provider.clone(),
                incident_type: incident.incident_type,
                severity: incident.severity,
                description: incident.description.clone(),
                business_impact: incident.business_impact,
                opened_at: incident.opened_at,
            },
        );

        incident
    }

    /// Close the open incident for a scope
    ///
    /// Auto-recovery respects `hold_open`; manual resolution does not.
    pub fn resolve(
        &self,
        service: &str,
        provider: Option<&str>,
        resolution: IncidentResolution,
    ) -> Option<Incident> {
        let key = (service.to_string(), provider.map(str::to_string));
        let id = self.open_index.get(&key).map(|id| *id)?;
        let closed = self.close(id, resolution)?;
        self.open_index.remove(&key);
        Some(closed)
    }

    /// Close a specific incident by id; used by operator tooling
    pub fn resolve_by_id(&self, id: Uuid, resolution: IncidentResolution) -> Option<Incident> {
        let closed = self.close(id, resolution)?;
        self.open_index
            .remove(&(closed.service.clone(), closed.provider.clone()));
        Some(closed)
    }

    fn close(&self, id: Uuid, resolution: IncidentResolution) -> Option<Incident> {
        let mut incident = self.incidents.get_mut(&id)?;
        if !incident.is_open() {
            return None;
        }
        if incident.hold_open && resolution == IncidentResolution::AutoRecovered {
            debug!(incident_id = %id, "incident held open, skipping auto-close");
            return None;
        }

        incident.closed_at = Some(self.clock.timestamp());
        let closed = incident.clone();
        drop(incident);

        info!(
            service = %closed.service,
            incident_id = %id,
            resolution = ?resolution,
            "incident closed"
        );

        self.sink.emit(
            EventMetadata::new(self.source_service.clone()),
            ResilienceEvent::IncidentClosed {
                incident_id: closed.id,
                service: closed.service.clone(),
                resolution,
                opened_at: closed.opened_at,
                closed_at: closed.closed_at.expect("just closed"),
            },
        );

        Some(closed)
    }

    /// Keep an incident open across health recovery
    pub fn hold_open(&self, id: Uuid) -> bool {
        match self.incidents.get_mut(&id) {
            Some(mut incident) if incident.is_open() => {
                incident.hold_open = true;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Incident> {
        self.incidents.get(&id).map(|i| i.clone())
    }

    pub fn open_incidents(&self) -> Vec<Incident> {
        let mut open: Vec<Incident> = self
            .incidents
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.value().clone())
            .collect();
        open.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        open
    }

    pub fn open_for_service(&self, service: &str) -> Vec<Incident> {
        self.open_incidents()
            .into_iter()
            .filter(|incident| incident.service == service)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ResilienceEvent>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, _metadata: EventMetadata, event: ResilienceEvent) {
            self.events.lock().push(event);
        }
    }

    fn log_with_sink() -> (IncidentLog, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let log = IncidentLog::new(
            sink.clone(),
            Arc::new(ManualClock::new()),
            "resilience-coordinator".to_string(),
        );
        (log, sink)
    }

    #[test]
    fn test_open_resolve_emits_events() {
        let (log, sink) = log_with_sink();

        let incident = log.open(
            "routing",
            Some("vendor-a"),
            IncidentType::Degradation,
            IncidentSeverity::Medium,
            "availability below target",
            ImpactLevel::High,
        );
        assert!(incident.is_open());

        let closed = log
            .resolve("routing", Some("vendor-a"), IncidentResolution::AutoRecovered)
            .unwrap();
        assert!(!closed.is_open());

        let events = sink.events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ResilienceEvent::IncidentOpened { .. }));
        assert!(matches!(events[1], ResilienceEvent::IncidentClosed { .. }));
    }

    #[test]
    fn test_reopen_escalates_instead_of_duplicating() {
        let (log, sink) = log_with_sink();

        let first = log.open(
            "routing",
            Some("vendor-a"),
            IncidentType::Degradation,
            IncidentSeverity::Medium,
            "degraded",
            ImpactLevel::Medium,
        );
        let second = log.open(
            "routing",
            Some("vendor-a"),
            IncidentType::Outage,
            IncidentSeverity::Critical,
            "offline",
            ImpactLevel::High,
        );

        assert_eq!(first.id, second.id);
        assert_eq!(second.severity, IncidentSeverity::Critical);
        assert_eq!(second.incident_type, IncidentType::Outage);
        // Only the original open was emitted
        assert_eq!(sink.events.lock().len(), 1);
        assert_eq!(log.open_incidents().len(), 1);
    }

    #[test]
    fn test_lower_severity_report_does_not_downgrade() {
        let (log, _sink) = log_with_sink();

        log.open(
            "routing",
            None,
            IncidentType::Outage,
            IncidentSeverity::Critical,
            "offline",
            ImpactLevel::Critical,
        );
        let unchanged = log.open(
            "routing",
            None,
            IncidentType::Degradation,
            IncidentSeverity::Low,
            "slightly slow",
            ImpactLevel::Low,
        );

        assert_eq!(unchanged.severity, IncidentSeverity::Critical);
        assert_eq!(unchanged.incident_type, IncidentType::Outage);
    }

    #[test]
    fn test_hold_open_blocks_auto_close_only() {
        let (log, _sink) = log_with_sink();

        let incident = log.open(
            "traffic",
            Some("vendor-c"),
            IncidentType::Degradation,
            IncidentSeverity::Medium,
            "vendor maintenance",
            ImpactLevel::Medium,
        );
        assert!(log.hold_open(incident.id));

        assert!(log
            .resolve("traffic", Some("vendor-c"), IncidentResolution::AutoRecovered)
            .is_none());
        assert!(log.get(incident.id).unwrap().is_open());

        let closed = log
            .resolve_by_id(incident.id, IncidentResolution::ManuallyResolved)
            .unwrap();
        assert!(!closed.is_open());
        assert!(log.open_for_service("traffic").is_empty());
    }
}
