//! Shared type definitions for the FIELDOPS Platform
//!
//! Core vocabulary (criticality, urgency, operation kinds) plus the event
//! schema the resilience engine publishes to downstream collaborators.

pub mod core;
pub mod events;

// Re-export core types
pub use core::{
    BusinessCriticality, DegradationLevel, ImpactLevel, IncidentSeverity, IncidentType,
    OperationKind, Urgency,
};

// Re-export event types
pub use events::{EventMetadata, IncidentResolution, ResilienceEvent};
