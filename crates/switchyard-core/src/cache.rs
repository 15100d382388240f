//! Per-stage routing cache
//!
//! Entries are keyed by a hash of (query, user, stage) and carry a
//! time-to-live chosen per routing method: pattern results are deterministic
//! and cache longest, LLM-backed stages cache shortest, fallback results are
//! never cached. Entries are immutable once written, so a racing writer only
//! re-inserts an identical value.

use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::{IntentResult, RoutingMethod};

/// TTLs applied per routing method
#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub pattern: Duration,
    pub classifier: Duration,
    pub fallback_classifier: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            pattern: Duration::from_secs(3600),
            classifier: Duration::from_secs(60),
            fallback_classifier: Duration::from_secs(60),
        }
    }
}

struct CacheEntry {
    result: IntentResult,
    inserted_at: Instant,
    ttl: Duration,
}

/// Bounded TTL cache shared by all chain stages
pub struct StageCache {
    entries: Mutex<LruCache<u64, CacheEntry>>,
    ttls: CacheTtls,
}

impl StageCache {
    pub fn new(capacity: usize, ttls: CacheTtls) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttls,
        }
    }

    fn key(query: &str, user_id: &str, method: RoutingMethod) -> u64 {
        let mut hasher = DefaultHasher::new();
        query.hash(&mut hasher);
        user_id.hash(&mut hasher);
        method.hash(&mut hasher);
        hasher.finish()
    }

    fn ttl_for(&self, method: RoutingMethod) -> Option<Duration> {
        match method {
            RoutingMethod::Pattern => Some(self.ttls.pattern),
            RoutingMethod::Classifier => Some(self.ttls.classifier),
            RoutingMethod::FallbackClassifier => Some(self.ttls.fallback_classifier),
            RoutingMethod::Fallback => None,
        }
    }

    /// Look up a fresh cached result for this stage.
    pub fn get(&self, query: &str, user_id: &str, method: RoutingMethod) -> Option<IntentResult> {
        let key = Self::key(query, user_id, method);
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() <= entry.ttl => {
                debug!("Stage cache hit for method {}", method);
                Some(entry.result.clone())
            }
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    /// Store a stage result. Fallback results are not cached.
    pub fn put(&self, query: &str, user_id: &str, result: &IntentResult) {
        let Some(ttl) = self.ttl_for(result.method) else {
            return;
        };
        let key = Self::key(query, user_id, result.method);
        let entry = CacheEntry {
            result: result.clone(),
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .put(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StageCache {
    fn default() -> Self {
        Self::new(1024, CacheTtls::default())
    }
}
