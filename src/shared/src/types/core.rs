//! Core type definitions for the FIELDOPS Platform
//!
//! This module contains shared vocabulary used across the platform services
//! to ensure consistency between the resilience engine and the operational
//! layers consuming its output.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// BUSINESS CLASSIFICATION TYPES
// ============================================================================

/// Business criticality of a logical service
///
/// Drives provider-selection bias and incident severity: a degraded
/// revenue-blocking service is handled very differently from a degraded
/// background-processing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessCriticality {
    RevenueBlocking,
    OperationalCritical,
    CustomerFacing,
    PerformanceOptimization,
    AnalyticsReporting,
    BackgroundProcessing,
}

impl Default for BusinessCriticality {
    fn default() -> Self {
        BusinessCriticality::OperationalCritical
    }
}

impl FromStr for BusinessCriticality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "revenue_blocking" => Ok(BusinessCriticality::RevenueBlocking),
            "operational_critical" => Ok(BusinessCriticality::OperationalCritical),
            "customer_facing" => Ok(BusinessCriticality::CustomerFacing),
            "performance_optimization" => Ok(BusinessCriticality::PerformanceOptimization),
            "analytics_reporting" => Ok(BusinessCriticality::AnalyticsReporting),
            "background_processing" => Ok(BusinessCriticality::BackgroundProcessing),
            _ => Err(format!("Invalid business criticality: {}", s)),
        }
    }
}

impl BusinessCriticality {
    /// Whether an outage of a service at this criticality is visible to
    /// customers or revenue immediately.
    pub fn is_customer_impacting(&self) -> bool {
        matches!(
            self,
            BusinessCriticality::RevenueBlocking | BusinessCriticality::CustomerFacing
        )
    }
}

/// Request urgency supplied by the caller per invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Urgency {
    fn default() -> Self {
        Urgency::Normal
    }
}

/// Estimated business impact of an incident or continuity plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for ImpactLevel {
    fn default() -> Self {
        ImpactLevel::Low
    }
}

// ============================================================================
// OPERATION TYPES
// ============================================================================

/// Logical operations the platform routes through external vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Single origin/destination route calculation
    Route,
    /// Distance/duration matrix over a batch of locations
    Matrix,
    /// Address to coordinate resolution
    Geocode,
    /// Live traffic conditions lookup
    Traffic,
    /// Customer messaging dispatch
    Message,
    /// Payment processing
    Payment,
    /// Lightweight health probe
    Probe,
}

impl OperationKind {
    /// Batch operations get per-item partial-success accounting
    pub fn is_batch(&self) -> bool {
        matches!(self, OperationKind::Matrix)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Route => "route",
            OperationKind::Matrix => "matrix",
            OperationKind::Geocode => "geocode",
            OperationKind::Traffic => "traffic",
            OperationKind::Message => "message",
            OperationKind::Payment => "payment",
            OperationKind::Probe => "probe",
        };
        f.write_str(s)
    }
}

// ============================================================================
// INCIDENT AND DEGRADATION TYPES
// ============================================================================

/// Incident classification used for SLA and operational tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    Outage,
    Degradation,
    Timeout,
    ErrorSpike,
    SlaBreach,
}

/// Incident severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// How far a served result deviates from the ideal primary-provider,
/// full-fidelity response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    None,
    Minor,
    Moderate,
    Severe,
    Offline,
}

impl Default for DegradationLevel {
    fn default() -> Self {
        DegradationLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criticality_from_str() {
        assert_eq!(
            "revenue_blocking".parse::<BusinessCriticality>().unwrap(),
            BusinessCriticality::RevenueBlocking
        );
        assert_eq!(
            "Background_Processing"
                .parse::<BusinessCriticality>()
                .unwrap(),
            BusinessCriticality::BackgroundProcessing
        );
        assert!("mission_critical".parse::<BusinessCriticality>().is_err());
    }

    #[test]
    fn test_criticality_serde_vocabulary() {
        let json = serde_json::to_string(&BusinessCriticality::CustomerFacing).unwrap();
        assert_eq!(json, "\"customer_facing\"");
    }

    #[test]
    fn test_degradation_ordering() {
        assert!(DegradationLevel::None < DegradationLevel::Minor);
        assert!(DegradationLevel::Moderate < DegradationLevel::Severe);
        assert!(DegradationLevel::Severe < DegradationLevel::Offline);
    }

    #[test]
    fn test_customer_impacting() {
        assert!(BusinessCriticality::RevenueBlocking.is_customer_impacting());
        assert!(!BusinessCriticality::AnalyticsReporting.is_customer_impacting());
    }
}
