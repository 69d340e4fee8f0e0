//! Provider Adapter Contracts
//!
//! The engine never talks to a vendor directly; each vendor binding is an
//! implementation of [`ProviderAdapter`] registered under its provider id.
//! Adapters return either a response with cost/latency metadata or a typed
//! [`ProviderFailure`] — every failure kind counts against the provider's
//! circuit breaker.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use fieldops_shared::OperationKind;

/// Typed failure from a vendor invocation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("vendor error {code}: {message}")]
    Vendor { code: u16, message: String },

    #[error("malformed vendor response: {0}")]
    Malformed(String),
}

impl ProviderFailure {
    /// Hint attached to exhausted-fallback results for this failure kind
    pub fn recommendation(&self, provider: &str) -> String {
        match self {
            ProviderFailure::Timeout(_) => format!(
                "provider {} timed out; increase the call timeout or check its network path",
                provider
            ),
            ProviderFailure::Transport(_) => {
                format!("provider {} is unreachable; verify connectivity and DNS", provider)
            }
            ProviderFailure::Vendor { code, .. } if *code == 401 || *code == 403 => {
                format!("check provider {} credentials", provider)
            }
            ProviderFailure::Vendor { .. } => {
                format!("provider {} returned an error; check its status page", provider)
            }
            ProviderFailure::Malformed(_) => format!(
                "provider {} returned an unparseable response; verify the API version in use",
                provider
            ),
        }
    }
}

/// Single operation request passed to an adapter
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation: OperationKind,
    pub params: Value,
}

/// Successful vendor response with billing and latency metadata
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub payload: Value,
    pub cost: f64,
    pub latency: Duration,
}

/// Batch counterpart; `None` marks items the vendor could not resolve
#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub items: Vec<Option<Value>>,
    pub cost: f64,
    pub latency: Duration,
}

impl BatchResponse {
    pub fn resolved(&self) -> usize {
        self.items.iter().filter(|i| i.is_some()).count()
    }
}

/// Uniform "invoke provider operation" capability, one impl per vendor
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Execute one operation within `timeout`
    async fn invoke(
        &self,
        request: &OperationRequest,
        timeout: Duration,
    ) -> Result<AdapterResponse, ProviderFailure>;

    /// Execute a batch of operations
    ///
    /// The default maps `invoke` over the items; vendors with native batch
    /// endpoints override it. Per-item vendor errors become unresolved
    /// items, a timeout aborts the whole batch.
    async fn invoke_batch(
        &self,
        operation: OperationKind,
        items: &[Value],
        timeout: Duration,
    ) -> Result<BatchResponse, ProviderFailure> {
        let mut resolved = Vec::with_capacity(items.len());
        let mut cost = 0.0;
        let mut latency = Duration::ZERO;

        for item in items {
            let request = OperationRequest {
                operation,
                params: item.clone(),
            };
            match self.invoke(&request, timeout).await {
                Ok(response) => {
                    cost += response.cost;
                    latency += response.latency;
                    resolved.push(Some(response.payload));
                }
                Err(ProviderFailure::Timeout(elapsed)) => {
                    return Err(ProviderFailure::Timeout(elapsed))
                }
                Err(_) => resolved.push(None),
            }
        }

        Ok(BatchResponse {
            items: resolved,
            cost,
            latency,
        })
    }

    /// Lightweight health probe; defaults to a `probe` operation
    async fn probe(&self, timeout: Duration) -> Result<Duration, ProviderFailure> {
        let request = OperationRequest {
            operation: OperationKind::Probe,
            params: Value::Null,
        };
        self.invoke(&request, timeout).await.map(|r| r.latency)
    }
}

/// Provider id to adapter binding table
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, provider_id: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider_id.into(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).map(|a| Arc::clone(&a))
    }

    pub fn remove(&self, provider_id: &str) -> bool {
        self.adapters.remove(provider_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FlakyAdapter;

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        async fn invoke(
            &self,
            request: &OperationRequest,
            _timeout: Duration,
        ) -> Result<AdapterResponse, ProviderFailure> {
            // Fails every request whose params carry {"fail": true}
            if request.params.get("fail").and_then(Value::as_bool) == Some(true) {
                return Err(ProviderFailure::Vendor {
                    code: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(AdapterResponse {
                payload: json!({"echo": request.params}),
                cost: 0.01,
                latency: Duration::from_millis(5),
            })
        }
    }

    #[tokio::test]
    async fn test_default_batch_marks_failures_unresolved() {
        let adapter = FlakyAdapter;
        let items = vec![json!({"fail": false}), json!({"fail": true}), json!({})];

        let batch = adapter
            .invoke_batch(OperationKind::Matrix, &items, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(batch.items.len(), 3);
        assert_eq!(batch.resolved(), 2);
        assert!(batch.items[1].is_none());
        assert!((batch.cost - 0.02).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_default_probe_uses_invoke() {
        let adapter = FlakyAdapter;
        let latency = adapter.probe(Duration::from_secs(1)).await.unwrap();
        assert_eq!(latency, Duration::from_millis(5));
    }

    #[test]
    fn test_credential_recommendation() {
        let failure = ProviderFailure::Vendor {
            code: 401,
            message: "unauthorized".to_string(),
        };
        assert!(failure.recommendation("vendor-a").contains("credentials"));
    }

    #[test]
    fn test_registry_insert_get() {
        let registry = AdapterRegistry::new();
        assert!(registry.is_empty());

        registry.insert("vendor-a", Arc::new(FlakyAdapter));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("vendor-a").is_some());
        assert!(registry.get("vendor-b").is_none());
        assert!(registry.remove("vendor-a"));
    }
}
