//! Health Monitoring
//!
//! Maintains a rolling [`HealthRecord`] per (service, provider) pair from
//! two inputs: periodic active probes through the provider adapters, and
//! passive observation of coordinator call outcomes. Latency and
//! availability are exponentially-weighted moving averages; threshold
//! crossings drive the incident lifecycle, and a trailing-window trend
//! analysis emits predictive recommendations before thresholds are hit.
//!
//! Probes feed the matching circuit breaker, health status never does —
//! breaker state and health state are deliberately separate machines: a
//! provider can be degraded while its breaker is still closed.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use fieldops_shared::{
    BusinessCriticality, EventMetadata, ImpactLevel, IncidentResolution, IncidentSeverity,
    IncidentType, ResilienceEvent,
};

use crate::adapter::{AdapterRegistry, ProviderFailure};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::config::{HealthConfig, PredictionConfig};
use crate::incident::{EventSink, IncidentLog};
use crate::models::{FailurePrediction, HealthRecord, HealthState};

/// Health monitoring statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitoringStats {
    /// Watched (service, provider) pairs
    pub total_targets: u64,

    pub healthy_targets: u64,

    pub degraded_targets: u64,

    pub unhealthy_targets: u64,

    pub offline_targets: u64,

    /// Active probes performed since startup
    pub total_probes: u64,

    /// Passive call outcomes recorded since startup
    pub passive_observations: u64,

    /// Predictive recommendations emitted since startup
    pub predictions_emitted: u64,

    pub last_updated: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default)]
struct StatsCounters {
    total_probes: u64,
    passive_observations: u64,
    predictions_emitted: u64,
}

/// Mutable monitoring state for one (service, provider) pair
struct ProviderHealth {
    record: HealthRecord,
    criticality: BusinessCriticality,
    /// Trailing (latency EWMA, availability EWMA) samples for trends
    samples: VecDeque<(f64, f64)>,
    /// Consecutive failed probes; drives offline detection and backoff
    probe_failures: u32,
    next_probe_due: Instant,
    last_prediction: Option<FailurePrediction>,
    predicted: bool,
}

enum Transition {
    Worsened {
        to: HealthState,
        incident_type: IncidentType,
        severity: IncidentSeverity,
        description: String,
    },
    Recovered,
}

/// Health monitor over all registered providers
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    prediction_config: PredictionConfig,
    targets: Arc<DashMap<(String, String), Arc<Mutex<ProviderHealth>>>>,
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    incidents: Arc<IncidentLog>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    source_service: String,
    probe_semaphore: Arc<Semaphore>,
    is_running: Arc<RwLock<bool>>,
    task_handles: Arc<RwLock<Vec<tokio::task::JoinHandle<()>>>>,
    stats: Arc<Mutex<StatsCounters>>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HealthConfig,
        prediction_config: PredictionConfig,
        adapters: Arc<AdapterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        incidents: Arc<IncidentLog>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        source_service: String,
    ) -> Self {
        let max_concurrent = config.max_concurrent_probes.max(1);
        Self {
            config,
            prediction_config,
            targets: Arc::new(DashMap::new()),
            adapters,
            breakers,
            incidents,
            sink,
            clock,
            source_service,
            probe_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            is_running: Arc::new(RwLock::new(false)),
            task_handles: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(Mutex::new(StatsCounters::default())),
        }
    }

    /// Add a (service, provider) pair to monitoring
    pub fn watch_provider(
        &self,
        service: &str,
        provider: &str,
        criticality: BusinessCriticality,
    ) {
        self.target(service, provider, criticality);
    }

    fn target(
        &self,
        service: &str,
        provider: &str,
        criticality: BusinessCriticality,
    ) -> Arc<Mutex<ProviderHealth>> {
        let key = (service.to_string(), provider.to_string());
        let now = self.clock.now();
        let jitter = self.schedule_jitter();
        self.targets
            .entry(key)
            .or_insert_with(|| {
                debug!(service, provider, "watching provider health");
                Arc::new(Mutex::new(ProviderHealth {
                    record: HealthRecord::new(service, provider),
                    criticality,
                    samples: VecDeque::new(),
                    probe_failures: 0,
                    next_probe_due: now + jitter,
                    last_prediction: None,
                    predicted: false,
                }))
            })
            .clone()
    }

    /// Stop monitoring one pair
    pub fn unwatch_provider(&self, service: &str, provider: &str) {
        self.targets
            .remove(&(service.to_string(), provider.to_string()));
    }

    /// Stop monitoring every provider of a removed service
    pub fn unwatch_service(&self, service: &str) {
        self.targets.retain(|(s, _), _| s != service);
    }

    /// Record a coordinator call outcome against a provider
    pub fn observe_call(
        &self,
        service: &str,
        provider: &str,
        outcome: Result<Duration, &ProviderFailure>,
    ) {
        let entry = self.target(service, provider, BusinessCriticality::default());

        self.stats.lock().passive_observations += 1;
        match outcome {
            Ok(latency) => {
                self.apply_outcome(&entry, true, latency.as_millis() as f64, None, false)
            }
            Err(failure) => {
                self.apply_outcome(&entry, false, 0.0, Some(failure.to_string()), false)
            }
        }
    }

    /// Probe every due target once; the monitoring loop calls this per tick
    pub async fn run_probe_sweep(&self) {
        let now = self.clock.now();
        let due: Vec<(String, String)> = self
            .targets
            .iter()
            .filter_map(|entry| {
                let mut health = entry.value().lock();
                if health.next_probe_due <= now {
                    // Claim the slot; the outcome reschedules properly
                    health.next_probe_due = now + self.config.probe_interval();
                    Some(entry.key().clone())
                } else {
                    None
                }
            })
            .collect();

        if due.is_empty() {
            return;
        }

        let probes = due.into_iter().map(|(service, provider)| {
            let monitor = self.clone();
            async move {
                let _permit = monitor.probe_semaphore.acquire().await;
                monitor.probe_target(&service, &provider).await;
            }
        });
        join_all(probes).await;
    }

    /// Probe every provider of a service immediately, ignoring schedules
    pub async fn check_service_now(&self, service: &str) -> Vec<HealthRecord> {
        let providers: Vec<String> = self
            .targets
            .iter()
            .filter(|entry| entry.key().0 == service)
            .map(|entry| entry.key().1.clone())
            .collect();

        let probes = providers.iter().map(|provider| {
            let monitor = self.clone();
            let service = service.to_string();
            let provider = provider.clone();
            async move {
                monitor.probe_target(&service, &provider).await;
            }
        });
        join_all(probes).await;

        self.records_for_service(service)
    }

    async fn probe_target(&self, service: &str, provider: &str) {
        let entry = match self
            .targets
            .get(&(service.to_string(), provider.to_string()))
        {
            Some(entry) => Arc::clone(&entry),
            // Removed while the probe was queued
            None => return,
        };

        self.stats.lock().total_probes += 1;

        let adapter = match self.adapters.get(provider) {
            Some(adapter) => adapter,
            None => {
                error!(service, provider, "no adapter registered for watched provider");
                self.apply_outcome(
                    &entry,
                    false,
                    0.0,
                    Some("no adapter registered".to_string()),
                    true,
                );
                return;
            }
        };

        let probe_timeout = self.config.probe_timeout();
        let outcome = match timeout(probe_timeout, adapter.probe(probe_timeout)).await {
            Ok(Ok(latency)) => Ok(latency),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(ProviderFailure::Timeout(probe_timeout)),
        };

        // Every probe result feeds the matching breaker
        let breaker = self.breakers.breaker(service, provider);
        match &outcome {
            Ok(latency) => {
                breaker.record_success();
                self.apply_outcome(&entry, true, latency.as_millis() as f64, None, true);
            }
            Err(failure) => {
                breaker.record_failure();
                self.apply_outcome(&entry, false, 0.0, Some(failure.to_string()), true);
            }
        }
    }

    /// Fold one observation into the record and act on what changed
    fn apply_outcome(
        &self,
        entry: &Arc<Mutex<ProviderHealth>>,
        success: bool,
        latency_ms: f64,
        error_message: Option<String>,
        is_probe: bool,
    ) {
        let alpha = self.config.ewma_alpha;
        let (transition, prediction, service, provider, criticality);
        {
            let mut health = entry.lock();
            let previous = health.record.status;

            let sample = if success { 1.0 } else { 0.0 };
            health.record.availability =
                alpha * sample + (1.0 - alpha) * health.record.availability;
            if success {
                health.record.avg_latency_ms = if health.record.last_check.is_none() {
                    latency_ms
                } else {
                    alpha * latency_ms + (1.0 - alpha) * health.record.avg_latency_ms
                };
                health.record.consecutive_failures = 0;
                health.record.last_error = None;
            } else {
                health.record.consecutive_failures += 1;
                health.record.last_error = error_message;
            }
            health.record.last_check = Some(self.clock.timestamp());

            if is_probe {
                if success {
                    health.probe_failures = 0;
                    health.next_probe_due =
                        self.clock.now() + self.config.probe_interval() + self.schedule_jitter();
                } else {
                    health.probe_failures += 1;
                    // Back off a repeatedly failing target instead of
                    // hammering it
                    let exponent = health.probe_failures.min(5);
                    let delay = self
                        .config
                        .probe_interval()
                        .saturating_mul(1u32 << exponent)
                        .min(self.config.max_probe_backoff());
                    health.next_probe_due = self.clock.now() + delay + self.schedule_jitter();
                }
            }

            let latency_sample = health.record.avg_latency_ms;
            let availability_sample = health.record.availability;
            health.samples.push_back((latency_sample, availability_sample));
            while health.samples.len() > self.prediction_config.window_size {
                health.samples.pop_front();
            }

            health.record.status = self.derive_status(&health);
            transition = self.classify_transition(previous, &health);
            prediction = self.evaluate_prediction(&mut health);
            service = health.record.service.clone();
            provider = health.record.provider.clone();
            criticality = health.criticality;
        }

        if let Some(transition) = transition {
            self.act_on_transition(&service, &provider, criticality, transition);
        }
        if let Some(prediction) = prediction {
            self.emit_prediction(prediction);
        }
    }

    fn derive_status(&self, health: &ProviderHealth) -> HealthState {
        let record = &health.record;
        let target = self.config.latency_target_ms;

        if health.probe_failures >= self.config.offline_after_failures {
            HealthState::Offline
        } else if record.availability < 0.80 || record.avg_latency_ms >= 2.0 * target {
            HealthState::Unhealthy
        } else if record.availability < 0.95 || record.avg_latency_ms > target {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn classify_transition(
        &self,
        previous: HealthState,
        health: &ProviderHealth,
    ) -> Option<Transition> {
        let current = health.record.status;
        if current == previous {
            return None;
        }

        if current > previous {
            let record = &health.record;
            let (incident_type, severity, description) = match current {
                HealthState::Degraded => (
                    IncidentType::Degradation,
                    IncidentSeverity::Medium,
                    format!(
                        "provider {} degraded: availability {:.1}%, avg latency {:.0}ms",
                        record.provider,
                        record.availability * 100.0,
                        record.avg_latency_ms
                    ),
                ),
                HealthState::Unhealthy => {
                    let latency_driven =
                        record.avg_latency_ms >= 2.0 * self.config.latency_target_ms;
                    (
                        if latency_driven {
                            IncidentType::Timeout
                        } else {
                            IncidentType::ErrorSpike
                        },
                        IncidentSeverity::High,
                        format!(
                            "provider {} unhealthy: availability {:.1}%, avg latency {:.0}ms",
                            record.provider,
                            record.availability * 100.0,
                            record.avg_latency_ms
                        ),
                    )
                }
                HealthState::Offline => (
                    IncidentType::Outage,
                    IncidentSeverity::Critical,
                    format!(
                        "provider {} offline: {} consecutive failed probes",
                        record.provider, health.probe_failures
                    ),
                ),
                HealthState::Healthy => unreachable!("healthy is the minimum state"),
            };
            Some(Transition::Worsened {
                to: current,
                incident_type,
                severity,
                description,
            })
        } else if current == HealthState::Healthy {
            Some(Transition::Recovered)
        } else {
            // Partial recovery (e.g. offline -> degraded); the open
            // incident stays until fully healthy
            None
        }
    }

    fn act_on_transition(
        &self,
        service: &str,
        provider: &str,
        criticality: BusinessCriticality,
        transition: Transition,
    ) {
        match transition {
            Transition::Worsened {
                to,
                incident_type,
                severity,
                description,
            } => {
                warn!(service, provider, status = ?to, "provider health worsened");
                self.incidents.open(
                    service,
                    Some(provider),
                    incident_type,
                    severity,
                    description,
                    Self::impact_for(criticality),
                );
            }
            Transition::Recovered => {
                info!(service, provider, "provider recovered");
                self.incidents
                    .resolve(service, Some(provider), IncidentResolution::AutoRecovered);
            }
        }
    }

    fn impact_for(criticality: BusinessCriticality) -> ImpactLevel {
        match criticality {
            BusinessCriticality::RevenueBlocking => ImpactLevel::Critical,
            BusinessCriticality::OperationalCritical | BusinessCriticality::CustomerFacing => {
                ImpactLevel::High
            }
            BusinessCriticality::PerformanceOptimization => ImpactLevel::Medium,
            BusinessCriticality::AnalyticsReporting | BusinessCriticality::BackgroundProcessing => {
                ImpactLevel::Low
            }
        }
    }

    /// Estimate failure probability from the trailing trend
    ///
    /// A recommendation is only worth emitting while the provider is still
    /// inside its thresholds and the trend is worsening; the incident
    /// machinery takes over once a threshold is actually crossed.
    fn evaluate_prediction(&self, health: &mut ProviderHealth) -> Option<FailurePrediction> {
        if !self.prediction_config.enabled
            || health.samples.len() < self.prediction_config.min_samples
        {
            return None;
        }

        let latencies: Vec<f64> = health.samples.iter().map(|(l, _)| *l).collect();
        let availabilities: Vec<f64> = health.samples.iter().map(|(_, a)| *a).collect();
        let latency_slope = least_squares_slope(&latencies);
        let availability_slope = least_squares_slope(&availabilities);

        let worsening = latency_slope > 0.0 || availability_slope < 0.0;
        if !worsening {
            health.predicted = false;
            return None;
        }

        let horizon = self.prediction_config.window_size as f64;
        let target = self.config.latency_target_ms;
        let projected_latency = health.record.avg_latency_ms + latency_slope * horizon;
        let projected_availability = health.record.availability + availability_slope * horizon;

        let latency_risk = clamp01(projected_latency / (2.0 * target));
        let availability_risk = clamp01((0.95 - projected_availability) / 0.15);
        let probability = clamp01(latency_risk.max(availability_risk));

        if probability < self.prediction_config.failure_probability_threshold {
            health.predicted = false;
            return None;
        }

        let prediction = FailurePrediction {
            service: health.record.service.clone(),
            provider: health.record.provider.clone(),
            failure_probability: probability,
            latency_slope_ms: latency_slope,
            availability_slope,
            recommendation: format!(
                "provider {} of {} is trending toward failure (p={:.2}); consider shifting \
                 traffic to an alternate provider or enabling a cache fallback before it trips",
                health.record.provider, health.record.service, probability
            ),
            generated_at: self.clock.timestamp(),
        };
        health.last_prediction = Some(prediction.clone());

        // Emit once per threshold crossing, not on every sample above it
        if health.predicted {
            return None;
        }
        health.predicted = true;
        Some(prediction)
    }

    fn emit_prediction(&self, prediction: FailurePrediction) {
        warn!(
            service = %prediction.service,
            provider = %prediction.provider,
            probability = prediction.failure_probability,
            "predictive failure recommendation"
        );
        self.stats.lock().predictions_emitted += 1;
        self.sink.emit(
            EventMetadata::new(self.source_service.clone()),
            ResilienceEvent::FailurePredicted {
                service: prediction.service.clone(),
                provider: prediction.provider.clone(),
                failure_probability: prediction.failure_probability,
                recommendation: prediction.recommendation.clone(),
            },
        );
    }

    fn schedule_jitter(&self) -> Duration {
        let interval_ms = self.config.probe_interval().as_millis() as u64;
        if interval_ms < 10 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..interval_ms / 10))
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    pub fn record(&self, service: &str, provider: &str) -> Option<HealthRecord> {
        self.targets
            .get(&(service.to_string(), provider.to_string()))
            .map(|entry| entry.lock().record.clone())
    }

    /// Every record, sorted by service then provider
    pub fn records(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self
            .targets
            .iter()
            .map(|entry| entry.value().lock().record.clone())
            .collect();
        records.sort_by(|a, b| {
            (a.service.as_str(), a.provider.as_str()).cmp(&(b.service.as_str(), b.provider.as_str()))
        });
        records
    }

    pub fn records_for_service(&self, service: &str) -> Vec<HealthRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.service == service)
            .collect()
    }

    /// Best state among a service's providers, i.e. what it can still serve
    pub fn service_state(&self, service: &str) -> Option<HealthState> {
        self.records_for_service(service)
            .iter()
            .map(|record| record.status)
            .min()
    }

    /// Latest above-threshold predictions, one per target
    pub fn predictions(&self) -> Vec<FailurePrediction> {
        let mut predictions: Vec<FailurePrediction> = self
            .targets
            .iter()
            .filter_map(|entry| {
                let health = entry.value().lock();
                if health.predicted {
                    health.last_prediction.clone()
                } else {
                    None
                }
            })
            .collect();
        predictions.sort_by(|a, b| {
            (a.service.as_str(), a.provider.as_str()).cmp(&(b.service.as_str(), b.provider.as_str()))
        });
        predictions
    }

    pub fn stats(&self) -> HealthMonitoringStats {
        let counters = self.stats.lock();
        let records = self.records();
        let count = |state: HealthState| {
            records.iter().filter(|r| r.status == state).count() as u64
        };
        HealthMonitoringStats {
            total_targets: records.len() as u64,
            healthy_targets: count(HealthState::Healthy),
            degraded_targets: count(HealthState::Degraded),
            unhealthy_targets: count(HealthState::Unhealthy),
            offline_targets: count(HealthState::Offline),
            total_probes: counters.total_probes,
            passive_observations: counters.passive_observations,
            predictions_emitted: counters.predictions_emitted,
            last_updated: self.clock.timestamp(),
        }
    }

    // ------------------------------------------------------------------
    // Probe loop lifecycle
    // ------------------------------------------------------------------

    pub async fn start_monitoring(&self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("health probing disabled by configuration");
            return Ok(());
        }

        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(anyhow::anyhow!("health monitoring is already running"));
        }
        *is_running = true;
        drop(is_running);

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            monitor.monitoring_loop().await;
        });
        self.task_handles.write().await.push(handle);

        info!("health monitoring started");
        Ok(())
    }

    pub async fn stop_monitoring(&self) {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return;
        }
        *is_running = false;
        drop(is_running);

        let mut handles = self.task_handles.write().await;
        for handle in handles.drain(..) {
            handle.abort();
        }

        info!("health monitoring stopped");
    }

    async fn monitoring_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if !*self.is_running.read().await {
                break;
            }
            self.run_probe_sweep().await;
        }

        info!("health monitoring loop stopped");
    }
}

fn least_squares_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
