//! Fallback Cache Collaborator
//!
//! Cache reads happen only after every live provider has failed, so the
//! contract is deliberately small: get with age, put with ttl. The engine
//! ships an in-memory implementation; deployments point the coordinator at
//! a shared store by implementing [`FallbackCache`] over it.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::clock::Clock;

/// Cached value plus its age at read time
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub value: Value,
    pub age: Duration,
}

/// Cache contract consumed by the coordinator
#[async_trait]
pub trait FallbackCache: Send + Sync {
    /// Look up `key`; expired entries are a miss
    async fn get(&self, key: &str) -> Option<CachedEntry>;

    /// Store `value` under `key` for `ttl`
    async fn put(&self, key: &str, value: Value, ttl: Duration);
}

struct StoredEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

/// In-process cache used by tests and single-node deployments
pub struct InMemoryCache {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry; the read path also evicts lazily
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries
            .retain(|_, entry| now.duration_since(entry.stored_at) <= entry.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FallbackCache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<CachedEntry> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let age = now.duration_since(entry.stored_at);
                if age <= entry.ttl {
                    return Some(CachedEntry {
                        value: entry.value.clone(),
                        age,
                    });
                }
                true
            }
            None => false,
        };

        if expired {
            self.entries.remove(key);
            debug!(key, "evicted expired cache entry");
        }
        None
    }

    async fn put(&self, key: &str, value: Value, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                stored_at: self.clock.now(),
                ttl,
            },
        );
    }
}
