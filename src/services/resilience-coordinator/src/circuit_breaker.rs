//! Circuit Breakers
//!
//! One breaker per (service, provider) pair gates traffic ahead of every
//! vendor call. Transitions are serialized behind a per-breaker mutex so
//! concurrent successes and failures cannot race each other into an
//! inconsistent state. Breakers track both consecutive failures and the
//! failure rate over a trailing outcome window; an open breaker cools down
//! with exponential backoff before admitting a single half-open probe.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, traffic allowed
    Closed,
    /// Tripped, requests fail fast until the cooldown elapses
    Open,
    /// Cooled down, a single probe call is admitted
    HalfOpen,
}

/// Serializable breaker view for the mesh aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Failure fraction over the trailing window, 0.0 when empty
    pub window_failure_rate: f64,
}

struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    /// Trailing outcomes, `true` marks a failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    /// Consecutive reopens from half-open, drives the backoff exponent
    reopen_streak: u32,
    probe_in_flight: bool,
}

/// Failure-gating state machine for one (service, provider) pair
pub struct CircuitBreaker {
    service: String,
    provider: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    fn new(
        service: impl Into<String>,
        provider: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cooldown = config.base_cooldown();
        Self {
            service: service.into(),
            provider: provider.into(),
            config,
            clock,
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window: VecDeque::new(),
                opened_at: None,
                cooldown,
                reopen_streak: 0,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may be issued right now
    ///
    /// In half-open this *claims* the single probe slot, so only call it
    /// immediately before invoking the provider; the claim is released by
    /// the recorded outcome.
    pub fn allow(&self) -> bool {
        let mut core = self.core.lock();
        self.advance_cooldown(&mut core);

        match core.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if core.probe_in_flight {
                    false
                } else {
                    core.probe_in_flight = true;
                    debug!(
                        service = %self.service,
                        provider = %self.provider,
                        "admitting half-open probe"
                    );
                    true
                }
            }
        }
    }

    /// Non-claiming availability peek used for candidate filtering
    pub fn is_available(&self) -> bool {
        let mut core = self.core.lock();
        self.advance_cooldown(&mut core);
        match core.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !core.probe_in_flight,
        }
    }

    pub fn record_success(&self) {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::HalfOpen => {
                info!(
                    service = %self.service,
                    provider = %self.provider,
                    "probe succeeded, closing circuit breaker"
                );
                core.state = CircuitState::Closed;
                core.consecutive_failures = 0;
                core.window.clear();
                core.opened_at = None;
                core.probe_in_flight = false;
                core.reopen_streak = 0;
                core.cooldown = self.config.base_cooldown();
            }
            CircuitState::Closed => {
                core.consecutive_failures = 0;
                self.push_outcome(&mut core, false);
            }
            // Stale success racing a trip that already happened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut core = self.core.lock();
        match core.state {
            CircuitState::HalfOpen => {
                core.probe_in_flight = false;
                core.reopen_streak += 1;
                let exponent = core.reopen_streak.min(16);
                core.cooldown = self
                    .config
                    .base_cooldown()
                    .saturating_mul(1u32 << exponent.min(31))
                    .min(self.config.max_cooldown());
                warn!(
                    service = %self.service,
                    provider = %self.provider,
                    cooldown_secs = core.cooldown.as_secs(),
                    "probe failed, reopening circuit breaker"
                );
                self.open(&mut core);
            }
            CircuitState::Closed => {
                core.consecutive_failures += 1;
                self.push_outcome(&mut core, true);
                if self.should_trip(&core) {
                    warn!(
                        service = %self.service,
                        provider = %self.provider,
                        consecutive_failures = core.consecutive_failures,
                        failure_rate = Self::window_failure_rate(&core),
                        "failure threshold reached, opening circuit breaker"
                    );
                    core.cooldown = self.config.base_cooldown();
                    core.reopen_streak = 0;
                    self.open(&mut core);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state; advances open breakers whose cooldown has elapsed
    pub fn state(&self) -> CircuitState {
        let mut core = self.core.lock();
        self.advance_cooldown(&mut core);
        core.state
    }

    /// Operator override: force the breaker closed and clear counters
    pub fn reset(&self) {
        let mut core = self.core.lock();
        info!(
            service = %self.service,
            provider = %self.provider,
            "circuit breaker reset"
        );
        core.state = CircuitState::Closed;
        core.consecutive_failures = 0;
        core.window.clear();
        core.opened_at = None;
        core.probe_in_flight = false;
        core.reopen_streak = 0;
        core.cooldown = self.config.base_cooldown();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut core = self.core.lock();
        self.advance_cooldown(&mut core);
        BreakerSnapshot {
            service: self.service.clone(),
            provider: self.provider.clone(),
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            window_failure_rate: Self::window_failure_rate(&core),
        }
    }

    fn open(&self, core: &mut BreakerCore) {
        core.state = CircuitState::Open;
        core.opened_at = Some(self.clock.now());
        core.probe_in_flight = false;
    }

    fn advance_cooldown(&self, core: &mut BreakerCore) {
        if core.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = core.opened_at {
            if self.clock.now().duration_since(opened_at) >= core.cooldown {
                debug!(
                    service = %self.service,
                    provider = %self.provider,
                    "cooldown elapsed, circuit breaker half-open"
                );
                core.state = CircuitState::HalfOpen;
                core.probe_in_flight = false;
            }
        }
    }

    fn push_outcome(&self, core: &mut BreakerCore, failed: bool) {
        core.window.push_back(failed);
        while core.window.len() > self.config.window_size {
            core.window.pop_front();
        }
    }

    fn should_trip(&self, core: &BreakerCore) -> bool {
        if core.consecutive_failures >= self.config.consecutive_failure_threshold {
            return true;
        }
        core.window.len() >= self.config.min_window_calls
            && Self::window_failure_rate(core) >= self.config.failure_rate_threshold
    }

    fn window_failure_rate(core: &BreakerCore) -> f64 {
        if core.window.is_empty() {
            return 0.0;
        }
        let failures = core.window.iter().filter(|failed| **failed).count();
        failures as f64 / core.window.len() as f64
    }
}

/// Breaker table keyed by (service, provider)
pub struct CircuitBreakerRegistry {
    breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
        }
    }

    /// Fetch the breaker for a pair, creating it closed on first use
    pub fn breaker(&self, service: &str, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry((service.to_string(), provider.to_string()))
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    provider,
                    self.config.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }

    pub fn get(&self, service: &str, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(&(service.to_string(), provider.to_string()))
            .map(|b| Arc::clone(&b))
    }

    /// Operator override for one pair; false when the pair is unknown
    pub fn reset(&self, service: &str, provider: &str) -> bool {
        match self.get(service, provider) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Drop every breaker belonging to a removed service
    pub fn remove_service(&self, service: &str) {
        self.breakers.retain(|(s, _), _| s != service);
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| {
            (a.service.as_str(), a.provider.as_str()).cmp(&(b.service.as_str(), b.provider.as_str()))
        });
        snapshots
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.value().state() == CircuitState::Open)
            .count()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
