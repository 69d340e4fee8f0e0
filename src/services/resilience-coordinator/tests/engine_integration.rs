//! End-to-end engine tests
//!
//! Drive the coordinator through scripted vendor adapters and a manual
//! clock: breaker trips and recovery, cache and degraded fallback tiers,
//! cost budgets, deadline propagation, predictive recommendations, and
//! operator overrides.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fieldops_shared::{
    BusinessCriticality, DegradationLevel, EventMetadata, ImpactLevel, IncidentSeverity,
    IncidentType, OperationKind, ResilienceEvent, Urgency,
};
use resilience_coordinator::adapter::{
    AdapterRegistry, AdapterResponse, OperationRequest, ProviderAdapter, ProviderFailure,
};
use resilience_coordinator::cache::InMemoryCache;
use resilience_coordinator::clock::{Clock, ManualClock};
use resilience_coordinator::config::ResilienceConfig;
use resilience_coordinator::coordinator::FallbackCoordinator;
use resilience_coordinator::incident::EventSink;
use resilience_coordinator::circuit_breaker::CircuitState;
use resilience_coordinator::models::{
    BusinessContext, CacheStrategy, DegradedFunctionality, ExecutionOptions, HealthState,
    ManualOperation, ProviderConfig, RegisterStrategyRequest, StrategyType,
};

#[derive(Clone)]
enum ScriptedOutcome {
    Ok { payload: Value, latency_ms: u64 },
    Fail(ProviderFailure),
}

/// Test adapter driven by a queue of outcomes; the last entry repeats.
/// Optionally advances a manual clock on every call to simulate elapsed
/// wall time.
struct ScriptedAdapter {
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    cost: f64,
    calls: AtomicUsize,
    advance_per_call: Option<(ManualClock, Duration)>,
}

impl ScriptedAdapter {
    fn sequence(cost: f64, outcomes: Vec<ScriptedOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            cost,
            calls: AtomicUsize::new(0),
            advance_per_call: None,
        })
    }

    fn ok(cost: f64, latency_ms: u64) -> Arc<Self> {
        Self::sequence(
            cost,
            vec![ScriptedOutcome::Ok {
                payload: json!({"status": "ok"}),
                latency_ms,
            }],
        )
    }

    fn failing(cost: f64, failure: ProviderFailure) -> Arc<Self> {
        Self::sequence(cost, vec![ScriptedOutcome::Fail(failure)])
    }

    fn slow_failing(cost: f64, clock: ManualClock, advance: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(
                vec![ScriptedOutcome::Fail(ProviderFailure::Timeout(advance))].into(),
            ),
            cost,
            calls: AtomicUsize::new(0),
            advance_per_call: Some((clock, advance)),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> ScriptedOutcome {
        let mut outcomes = self.outcomes.lock();
        if outcomes.len() > 1 {
            outcomes.pop_front().expect("non-empty")
        } else {
            outcomes
                .front()
                .cloned()
                .unwrap_or(ScriptedOutcome::Fail(ProviderFailure::Transport(
                    "script exhausted".to_string(),
                )))
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn invoke(
        &self,
        request: &OperationRequest,
        _timeout: Duration,
    ) -> Result<AdapterResponse, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((clock, advance)) = &self.advance_per_call {
            clock.advance(*advance);
        }
        // Per-item failure switch used by batch tests
        if request.params.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(ProviderFailure::Vendor {
                code: 500,
                message: "scripted item failure".to_string(),
            });
        }
        match self.next_outcome() {
            ScriptedOutcome::Ok {
                payload,
                latency_ms,
            } => Ok(AdapterResponse {
                payload,
                cost: self.cost,
                latency: Duration::from_millis(latency_ms),
            }),
            ScriptedOutcome::Fail(failure) => Err(failure),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, _metadata: EventMetadata, event: ResilienceEvent) {
        self.events.lock().push(event);
    }
}

struct TestEngine {
    coordinator: FallbackCoordinator,
    adapters: Arc<AdapterRegistry>,
    clock: ManualClock,
    sink: Arc<RecordingSink>,
}

fn engine() -> TestEngine {
    engine_with(test_config())
}

fn engine_with(config: ResilienceConfig) -> TestEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();

    let clock = ManualClock::new();
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
    let adapters = Arc::new(AdapterRegistry::new());
    let cache = Arc::new(InMemoryCache::new(Arc::clone(&clock_arc)));
    let sink = Arc::new(RecordingSink::default());
    let coordinator = FallbackCoordinator::with_clock(
        config,
        Arc::clone(&adapters),
        cache,
        sink.clone(),
        clock_arc,
    );
    TestEngine {
        coordinator,
        adapters,
        clock,
        sink,
    }
}

fn test_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    // Deterministic thresholds: no smoothing in most scenarios
    config.health.ewma_alpha = 1.0;
    config
}

fn provider(id: &str, priority: u8, cost: f64) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        priority,
        cost_per_request: cost,
        capabilities: vec![
            OperationKind::Route,
            OperationKind::Matrix,
            OperationKind::Geocode,
            OperationKind::Probe,
        ],
        region: None,
        timeout_ms: None,
    }
}

fn strategy(service: &str, providers: Vec<ProviderConfig>) -> RegisterStrategyRequest {
    RegisterStrategyRequest {
        service: service.to_string(),
        business_criticality: BusinessCriticality::OperationalCritical,
        strategy_type: StrategyType::AlternativeProvider,
        providers,
        cache: None,
        degraded: None,
        manual: None,
        continuity: None,
        cost: None,
        default_timeout_ms: Some(5_000),
    }
}

#[tokio::test]
async fn breaker_opens_after_consecutive_timeouts_and_traffic_shifts() {
    let engine = engine();
    let vendor_a = ScriptedAdapter::failing(
        0.10,
        ProviderFailure::Timeout(Duration::from_secs(5)),
    );
    let vendor_b = ScriptedAdapter::ok(0.12, 80);
    engine.adapters.insert("vendor-a", vendor_a.clone());
    engine.adapters.insert("vendor-b", vendor_b.clone());
    engine
        .coordinator
        .register_strategy(strategy(
            "routing",
            vec![provider("vendor-a", 1, 0.10), provider("vendor-b", 2, 0.12)],
        ))
        .unwrap();

    // Five executions: vendor-a times out each time, vendor-b serves
    for _ in 0..5 {
        let result = engine
            .coordinator
            .execute(
                "routing",
                OperationKind::Route,
                json!({"from": "depot", "to": "site-9"}),
                &BusinessContext::default(),
                &ExecutionOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.provider.as_deref(), Some("vendor-b"));
        assert_eq!(result.degradation, DegradationLevel::Minor);
        assert_eq!(result.attempts.len(), 2);
    }

    // Threshold of 5 consecutive failures reached: breaker open
    let breaker = engine.coordinator.breakers().breaker("routing", "vendor-a");
    assert_eq!(breaker.state(), CircuitState::Open);

    // Next call skips vendor-a entirely
    let calls_before = vendor_a.calls();
    let result = engine
        .coordinator
        .execute(
            "routing",
            OperationKind::Route,
            json!({"from": "depot", "to": "site-9"}),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.provider.as_deref(), Some("vendor-b"));
    assert_eq!(result.degradation, DegradationLevel::Minor);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(vendor_a.calls(), calls_before);

    // Cost impact vs. the cheapest configured provider: (0.12-0.10)/0.10
    assert!((result.cost_impact_percent - 20.0).abs() < 1e-9);
}

#[tokio::test]
async fn fresh_cache_serves_when_all_providers_down() {
    let engine = engine();
    let vendor = ScriptedAdapter::sequence(
        0.05,
        vec![
            ScriptedOutcome::Ok {
                payload: json!({"lat": 52.52, "lon": 13.40}),
                latency_ms: 60,
            },
            ScriptedOutcome::Fail(ProviderFailure::Transport("connection refused".to_string())),
        ],
    );
    engine.adapters.insert("vendor-a", vendor);

    let mut request = strategy("geocoding", vec![provider("vendor-a", 1, 0.05)]);
    request.strategy_type = StrategyType::CacheOnly;
    request.cache = Some(CacheStrategy {
        max_age_seconds: 600,
        stale_while_revalidate: false,
    });
    engine.coordinator.register_strategy(request).unwrap();

    let params = json!({"address": "Alexanderplatz 1"});

    // First call succeeds and populates the cache
    let result = engine
        .coordinator
        .execute(
            "geocoding",
            OperationKind::Geocode,
            params.clone(),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert!(!result.cache_used);

    // 300 seconds later the provider is down; the cached value is younger
    // than max_age and serves at moderate degradation
    engine.clock.advance(Duration::from_secs(300));
    let result = engine
        .coordinator
        .execute(
            "geocoding",
            OperationKind::Geocode,
            params,
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.cache_used);
    assert_eq!(result.degradation, DegradationLevel::Moderate);
    assert_eq!(result.payload.unwrap()["lat"], json!(52.52));
    assert_eq!(result.metadata["cache_age_seconds"], json!(300));
}

#[tokio::test]
async fn stale_cache_serves_with_background_refresh_when_revalidate_enabled() {
    let engine = engine();
    let vendor = ScriptedAdapter::sequence(
        0.05,
        vec![
            // Populating call, then a failure, then the refresh succeeds,
            // then failures again
            ScriptedOutcome::Ok {
                payload: json!({"version": 1}),
                latency_ms: 40,
            },
            ScriptedOutcome::Fail(ProviderFailure::Transport("down".to_string())),
            ScriptedOutcome::Ok {
                payload: json!({"version": 2}),
                latency_ms: 40,
            },
            ScriptedOutcome::Fail(ProviderFailure::Transport("down".to_string())),
        ],
    );
    engine.adapters.insert("vendor-a", vendor);

    let mut request = strategy("geocoding", vec![provider("vendor-a", 1, 0.05)]);
    request.strategy_type = StrategyType::CacheOnly;
    request.cache = Some(CacheStrategy {
        max_age_seconds: 60,
        stale_while_revalidate: true,
    });
    engine.coordinator.register_strategy(request).unwrap();

    let params = json!({"address": "Alexanderplatz 1"});
    let ctx = BusinessContext::default();
    let options = ExecutionOptions::default();

    engine
        .coordinator
        .execute("geocoding", OperationKind::Geocode, params.clone(), &ctx, &options)
        .await
        .unwrap();

    // Entry is now stale but within the retention window
    engine.clock.advance(Duration::from_secs(120));
    let result = engine
        .coordinator
        .execute("geocoding", OperationKind::Geocode, params.clone(), &ctx, &options)
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.cache_used);
    assert_eq!(result.degradation, DegradationLevel::Severe);
    assert_eq!(result.metadata["stale"], json!(true));
    assert_eq!(result.payload.unwrap()["version"], json!(1));

    // Give the background refresh a moment to repopulate the key
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = engine
        .coordinator
        .execute("geocoding", OperationKind::Geocode, params, &ctx, &options)
        .await
        .unwrap();
    assert!(result.cache_used);
    assert_eq!(result.degradation, DegradationLevel::Moderate);
    assert_eq!(result.payload.unwrap()["version"], json!(2));
}

#[tokio::test]
async fn cost_budget_rejects_expensive_survivor_with_recommendation() {
    let engine = engine();
    engine
        .adapters
        .insert("vendor-a", ScriptedAdapter::ok(0.10, 50));
    engine
        .adapters
        .insert("vendor-b", ScriptedAdapter::ok(0.14, 50));
    engine
        .coordinator
        .register_strategy(strategy(
            "payments",
            vec![provider("vendor-a", 1, 0.10), provider("vendor-b", 2, 0.14)],
        ))
        .unwrap();

    // Trip vendor-a's breaker so only the 40%-more-expensive vendor-b is live
    let breaker = engine.coordinator.breakers().breaker("payments", "vendor-a");
    for _ in 0..5 {
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let ctx = BusinessContext {
        revenue_impacting: true,
        max_cost_increase_percent: Some(10.0),
        ..Default::default()
    };
    let result = engine
        .coordinator
        .execute(
            "payments",
            OperationKind::Route,
            json!({"invoice": 17}),
            &ctx,
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.metadata["reason"], json!("budget_exceeded"));
    // Priced-out candidates are not provider failures
    assert!(result.attempts.is_empty());
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.contains("40%") && r.contains("vendor-b")));
    // The breaker state of vendor-b is untouched
    assert_eq!(
        engine.coordinator.breakers().breaker("payments", "vendor-b").state(),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn climbing_latency_emits_prediction_before_any_incident() {
    let mut config = test_config();
    config.health.latency_target_ms = 2_000.0;
    config.prediction.min_samples = 3;
    config.prediction.window_size = 5;
    let engine = engine_with(config);

    let vendor = ScriptedAdapter::sequence(
        0.08,
        vec![
            ScriptedOutcome::Ok { payload: json!({}), latency_ms: 400 },
            ScriptedOutcome::Ok { payload: json!({}), latency_ms: 800 },
            ScriptedOutcome::Ok { payload: json!({}), latency_ms: 1_200 },
        ],
    );
    engine.adapters.insert("vendor-c", vendor);
    engine
        .coordinator
        .register_strategy(strategy("traffic", vec![provider("vendor-c", 1, 0.08)]))
        .unwrap();

    for _ in 0..3 {
        let result = engine
            .coordinator
            .execute(
                "traffic",
                OperationKind::Route,
                json!({"segment": "a100"}),
                &BusinessContext::default(),
                &ExecutionOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.success);
    }

    let predictions = engine.coordinator.health().predictions();
    assert_eq!(predictions.len(), 1);
    assert_eq!(predictions[0].provider, "vendor-c");
    assert!(predictions[0].failure_probability >= 0.7);

    // Recommendation precedes any incident
    assert!(engine.coordinator.incidents().open_for_service("traffic").is_empty());
    assert!(engine
        .sink
        .events()
        .iter()
        .any(|event| matches!(event, ResilienceEvent::FailurePredicted { provider, .. } if provider == "vendor-c")));
}

#[tokio::test]
async fn manual_fallback_opens_medium_degradation_incident() {
    let engine = engine();
    engine
        .adapters
        .insert("vendor-a", ScriptedAdapter::ok(0.05, 40));
    let mut request = strategy("traffic", vec![provider("vendor-a", 1, 0.05)]);
    request.continuity = Some(resilience_coordinator::models::BusinessContinuity {
        max_downtime_minutes: 60,
        impact_level: ImpactLevel::Medium,
        revenue_per_hour_at_risk: 1_500.0,
    });
    engine.coordinator.register_strategy(request).unwrap();

    let incident = engine
        .coordinator
        .trigger_manual_fallback("traffic", "vendor maintenance")
        .unwrap();

    assert_eq!(incident.incident_type, IncidentType::Degradation);
    assert_eq!(incident.severity, IncidentSeverity::Medium);
    assert!(incident.is_open());
    assert!(incident.description.contains("vendor maintenance"));
    assert!(matches!(
        engine.sink.events().first(),
        Some(ResilienceEvent::IncidentOpened { .. })
    ));

    // Unknown service fails fast as a configuration error
    assert!(engine
        .coordinator
        .trigger_manual_fallback("nonexistent", "x")
        .is_err());
}

#[tokio::test]
async fn caller_deadline_stops_candidate_loop_before_all_providers() {
    let engine = engine();
    for vendor in ["vendor-a", "vendor-b", "vendor-c"] {
        engine.adapters.insert(
            vendor,
            ScriptedAdapter::slow_failing(0.05, engine.clock.clone(), Duration::from_millis(100)),
        );
    }
    engine
        .coordinator
        .register_strategy(strategy(
            "routing",
            vec![
                provider("vendor-a", 1, 0.05),
                provider("vendor-b", 2, 0.05),
                provider("vendor-c", 3, 0.05),
            ],
        ))
        .unwrap();

    let options = ExecutionOptions {
        deadline_ms: Some(150),
        ..Default::default()
    };
    let result = engine
        .coordinator
        .execute(
            "routing",
            OperationKind::Route,
            json!({}),
            &BusinessContext::default(),
            &options,
        )
        .await
        .unwrap();

    // Each attempt burns 100ms of the 150ms budget: the third candidate is
    // never tried
    assert!(!result.success);
    assert_eq!(result.attempts.len(), 2);
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.contains("deadline")));
}

#[tokio::test]
async fn degraded_functionality_tier_serves_fallback_data() {
    let engine = engine();
    engine.adapters.insert(
        "vendor-a",
        ScriptedAdapter::failing(0.05, ProviderFailure::Transport("down".to_string())),
    );

    let mut request = strategy("traffic", vec![provider("vendor-a", 1, 0.05)]);
    request.strategy_type = StrategyType::DegradedFunctionality;
    request.degraded = Some(DegradedFunctionality {
        enabled_features: vec!["static-schedules".to_string()],
        disabled_features: vec!["live-traffic".to_string()],
        user_message: "Live traffic is temporarily unavailable".to_string(),
        fallback_data: Some(json!({"congestion": "unknown"})),
    });
    engine.coordinator.register_strategy(request).unwrap();

    let result = engine
        .coordinator
        .execute(
            "traffic",
            OperationKind::Route,
            json!({}),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.offline_mode);
    assert_eq!(result.degradation, DegradationLevel::Severe);
    assert_eq!(result.payload.unwrap()["congestion"], json!("unknown"));
    assert_eq!(
        result.metadata["user_message"],
        json!("Live traffic is temporarily unavailable")
    );
    assert_eq!(result.metadata["disabled_features"], json!(["live-traffic"]));
}

#[tokio::test]
async fn manual_operation_tier_returns_escalation_metadata() {
    let engine = engine();
    engine.adapters.insert(
        "vendor-a",
        ScriptedAdapter::failing(
            0.05,
            ProviderFailure::Vendor {
                code: 401,
                message: "invalid key".to_string(),
            },
        ),
    );

    let mut request = strategy("payments", vec![provider("vendor-a", 1, 0.05)]);
    request.strategy_type = StrategyType::ManualOperation;
    request.manual = Some(ManualOperation {
        escalation_path: "billing-oncall -> vendor-support".to_string(),
        estimated_resolution_minutes: 45,
        instructions: Some("process payments from the backoffice queue".to_string()),
    });
    engine.coordinator.register_strategy(request).unwrap();

    let result = engine
        .coordinator
        .execute(
            "payments",
            OperationKind::Route,
            json!({"invoice": 9}),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.offline_mode);
    assert_eq!(result.degradation, DegradationLevel::Offline);
    assert_eq!(
        result.metadata["escalation_path"],
        json!("billing-oncall -> vendor-support")
    );
    assert_eq!(result.metadata["estimated_resolution_minutes"], json!(45));
    // The 401 surfaces as a credentials hint
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.contains("escalate via billing-oncall")));
}

#[tokio::test]
async fn exhausted_fallbacks_return_actionable_metadata() {
    let engine = engine();
    engine.adapters.insert(
        "vendor-a",
        ScriptedAdapter::failing(
            0.05,
            ProviderFailure::Vendor {
                code: 401,
                message: "invalid key".to_string(),
            },
        ),
    );
    engine.adapters.insert(
        "vendor-b",
        ScriptedAdapter::failing(0.06, ProviderFailure::Timeout(Duration::from_secs(5))),
    );
    engine
        .coordinator
        .register_strategy(strategy(
            "routing",
            vec![provider("vendor-a", 1, 0.05), provider("vendor-b", 2, 0.06)],
        ))
        .unwrap();

    let result = engine
        .coordinator
        .execute(
            "routing",
            OperationKind::Route,
            json!({}),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.offline_mode);
    assert_eq!(result.metadata["reason"], json!("fallback_exhausted"));
    assert_eq!(result.attempts.len(), 2);
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.contains("check provider vendor-a credentials")));
    assert!(result
        .recommendations
        .iter()
        .any(|r| r.contains("cache fallback")));
}

#[tokio::test]
async fn batch_partial_success_reports_missing_fraction() {
    let engine = engine();
    engine
        .adapters
        .insert("vendor-a", ScriptedAdapter::ok(0.02, 30));
    engine
        .coordinator
        .register_strategy(strategy("routing", vec![provider("vendor-a", 1, 0.02)]))
        .unwrap();

    // One of four matrix cells fails inside the provider
    let items = vec![
        json!({"stop": 1}),
        json!({"stop": 2, "fail": true}),
        json!({"stop": 3}),
        json!({"stop": 4}),
    ];
    let result = engine
        .coordinator
        .execute_batch(
            "routing",
            OperationKind::Matrix,
            items,
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.degradation, DegradationLevel::Minor);
    assert_eq!(result.metadata["resolved"], json!(3));
    assert_eq!(result.metadata["total"], json!(4));
    let payload = result.payload.unwrap();
    assert_eq!(payload[0], json!({"status": "ok"}));
    assert_eq!(payload[1], Value::Null);
}

#[tokio::test]
async fn context_bias_orders_candidates_by_cost_or_availability() {
    let engine = engine();
    let vendor_a = ScriptedAdapter::ok(0.10, 50);
    let vendor_b = ScriptedAdapter::ok(0.05, 50);
    engine.adapters.insert("vendor-a", vendor_a);
    engine.adapters.insert("vendor-b", vendor_b);
    engine
        .coordinator
        .register_strategy(strategy(
            "routing",
            vec![provider("vendor-a", 1, 0.10), provider("vendor-b", 2, 0.05)],
        ))
        .unwrap();

    // Cost-sensitive default: the cheaper second-priority provider wins
    let result = engine
        .coordinator
        .execute(
            "routing",
            OperationKind::Route,
            json!({}),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.provider.as_deref(), Some("vendor-b"));
    assert_eq!(result.degradation, DegradationLevel::Minor);
    assert!((result.cost_impact_percent).abs() < 1e-9);

    // Critical path with equal availability falls back to priority order
    let ctx = BusinessContext {
        urgency: Urgency::Critical,
        ..Default::default()
    };
    let result = engine
        .coordinator
        .execute(
            "routing",
            OperationKind::Route,
            json!({}),
            &ctx,
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.provider.as_deref(), Some("vendor-a"));
    assert_eq!(result.degradation, DegradationLevel::None);
}

#[tokio::test]
async fn manual_health_check_produces_incident_and_records() {
    let engine = engine();
    engine.adapters.insert(
        "vendor-a",
        ScriptedAdapter::failing(0.05, ProviderFailure::Transport("down".to_string())),
    );
    engine
        .coordinator
        .register_strategy(strategy("routing", vec![provider("vendor-a", 1, 0.05)]))
        .unwrap();

    let outcome = engine
        .coordinator
        .trigger_manual_health_check("routing")
        .await
        .unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert!(outcome.records[0].status > HealthState::Healthy);
    let incident = outcome.incident.expect("incident for unhealthy service");
    assert!(incident.description.contains("manual health check"));
    assert!(incident.is_open());
}

#[tokio::test]
async fn strategy_round_trip_and_mesh_snapshots() {
    let engine = engine();
    engine
        .adapters
        .insert("vendor-a", ScriptedAdapter::ok(0.05, 40));
    let registered = engine
        .coordinator
        .register_strategy(strategy(
            "routing",
            vec![provider("vendor-a", 1, 0.05), provider("vendor-b", 2, 0.07)],
        ))
        .unwrap();

    // Round-trip through the registry
    let fetched = engine.coordinator.strategies().get("routing").unwrap();
    assert_eq!(registered, fetched);

    // Registration wires both providers into monitoring and breakers
    let mesh = engine.coordinator.mesh();
    let status = mesh.status();
    assert_eq!(status.total_nodes, 2);
    assert_eq!(status.healthy_nodes, 2);
    assert_eq!(status.open_circuit_breakers, 0);
    assert_eq!(mesh.circuit_breakers().len(), 2);

    // Idempotent without intervening state changes
    assert_eq!(mesh.status(), mesh.status());

    // Removing the strategy clears the topology
    engine.coordinator.remove_strategy("routing").unwrap();
    assert_eq!(engine.coordinator.mesh().status().total_nodes, 0);
    assert!(engine.coordinator.strategies().get("routing").is_err());
}

#[tokio::test]
async fn health_status_report_reflects_provider_state() {
    let engine = engine();
    engine.adapters.insert(
        "vendor-a",
        ScriptedAdapter::failing(0.05, ProviderFailure::Transport("down".to_string())),
    );
    engine
        .adapters
        .insert("vendor-b", ScriptedAdapter::ok(0.08, 40));
    engine
        .coordinator
        .register_strategy(strategy(
            "routing",
            vec![provider("vendor-a", 1, 0.05), provider("vendor-b", 2, 0.08)],
        ))
        .unwrap();
    engine
        .coordinator
        .register_strategy(strategy("geocoding", vec![provider("vendor-b", 1, 0.08)]))
        .unwrap();

    // Knock vendor-a down via a live call; vendor-b still serves routing
    let result = engine
        .coordinator
        .execute(
            "routing",
            OperationKind::Route,
            json!({}),
            &BusinessContext {
                urgency: Urgency::Critical,
                ..Default::default()
            },
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert!(result.success);

    let report = engine.coordinator.get_health_status(None).unwrap();
    let routing = &report.services["routing"];
    assert_eq!(routing.total_providers, 2);
    assert_eq!(routing.healthy_providers, 1);
    // The service can still serve through vendor-b
    assert_eq!(routing.status, HealthState::Healthy);
    assert_eq!(report.overall, HealthState::Healthy);

    let filtered = engine.coordinator.get_health_status(Some("geocoding")).unwrap();
    assert_eq!(filtered.services.len(), 1);
    assert!(engine.coordinator.get_health_status(Some("unknown")).is_err());
}

#[tokio::test]
async fn unknown_service_and_unsupported_operation_fail_fast() {
    let engine = engine();
    engine
        .adapters
        .insert("vendor-a", ScriptedAdapter::ok(0.05, 40));
    let mut request = strategy("messaging", vec![provider("vendor-a", 1, 0.05)]);
    request.providers[0].capabilities = vec![OperationKind::Message];
    engine.coordinator.register_strategy(request).unwrap();

    // No strategy at all
    let error = engine
        .coordinator
        .execute(
            "unknown",
            OperationKind::Route,
            json!({}),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(error.to_string().contains("Configuration"));

    // Strategy exists but no provider supports the operation
    let error = engine
        .coordinator
        .execute(
            "messaging",
            OperationKind::Route,
            json!({}),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(error.to_string().contains("supports"));
}

#[tokio::test]
async fn every_execution_emits_a_fallback_event() {
    let engine = engine();
    engine
        .adapters
        .insert("vendor-a", ScriptedAdapter::ok(0.05, 40));
    engine
        .coordinator
        .register_strategy(strategy("routing", vec![provider("vendor-a", 1, 0.05)]))
        .unwrap();

    engine
        .coordinator
        .execute(
            "routing",
            OperationKind::Route,
            json!({}),
            &BusinessContext::default(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    let events = engine.sink.events();
    assert!(events.iter().any(|event| matches!(
        event,
        ResilienceEvent::FallbackExecuted { service, success: true, .. } if service == "routing"
    )));
}
