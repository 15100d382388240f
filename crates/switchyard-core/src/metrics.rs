//! Routing metrics
//!
//! In-process counters keyed by routing method and by selected agent.
//! `snapshot` produces a serializable view for whatever sink the host wires
//! up; nothing here does IO.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{IntentResult, RoutingMethod};

/// Number of equal-width confidence histogram buckets over [0, 1]
pub const CONFIDENCE_BUCKETS: usize = 5;

#[derive(Debug, Default, Clone, Serialize)]
pub struct Counter {
    pub requests: u64,
    pub confidence_sum: f64,
    /// Histogram over [0, 1); confidence 1.0 lands in the last bucket
    pub confidence_buckets: [u64; CONFIDENCE_BUCKETS],
    pub latency_ms_sum: u64,
    pub enhancements: u64,
    pub overrides: u64,
}

impl Counter {
    fn record(&mut self, result: &IntentResult, latency_ms: u64) {
        self.requests += 1;
        self.confidence_sum += result.confidence;
        let bucket = ((result.confidence * CONFIDENCE_BUCKETS as f64) as usize)
            .min(CONFIDENCE_BUCKETS - 1);
        self.confidence_buckets[bucket] += 1;
        self.latency_ms_sum += latency_ms;
        if result.enhancement.is_some() {
            self.enhancements += 1;
        }
        if result.learned_override.is_some() {
            self.overrides += 1;
        }
    }

    pub fn avg_confidence(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.confidence_sum / self.requests as f64
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    total: Counter,
    per_method: HashMap<RoutingMethod, Counter>,
    per_agent: HashMap<String, Counter>,
}

/// Point-in-time export of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: Counter,
    pub per_method: HashMap<String, Counter>,
    pub per_agent: HashMap<String, Counter>,
}

#[derive(Debug, Default)]
pub struct RoutingMetrics {
    state: Mutex<MetricsState>,
}

impl RoutingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &IntentResult, latency_ms: u64) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.total.record(result, latency_ms);
        state
            .per_method
            .entry(result.method)
            .or_default()
            .record(result, latency_ms);
        state
            .per_agent
            .entry(result.selected_agent.clone())
            .or_default()
            .record(result, latency_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().expect("metrics mutex poisoned");
        MetricsSnapshot {
            total: state.total.clone(),
            per_method: state
                .per_method
                .iter()
                .map(|(m, c)| (m.to_string(), c.clone()))
                .collect(),
            per_agent: state
                .per_agent
                .iter()
                .map(|(a, c)| (a.clone(), c.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(agent: &str, method: RoutingMethod, confidence: f64) -> IntentResult {
        IntentResult::new("intent", confidence, method, agent)
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = RoutingMetrics::new();
        metrics.record(&result("lease", RoutingMethod::Pattern, 1.0), 5);
        metrics.record(&result("lease", RoutingMethod::Pattern, 1.0), 7);
        metrics.record(&result("support", RoutingMethod::Classifier, 0.9), 40);

        let snap = metrics.snapshot();
        assert_eq!(snap.total.requests, 3);
        assert_eq!(snap.total.latency_ms_sum, 52);
        assert_eq!(snap.per_method["pattern"].requests, 2);
        assert_eq!(snap.per_agent["support"].requests, 1);
    }

    #[test]
    fn test_confidence_histogram_buckets() {
        let metrics = RoutingMetrics::new();
        metrics.record(&result("a", RoutingMethod::Fallback, 0.5), 0);
        metrics.record(&result("a", RoutingMethod::Classifier, 0.85), 0);
        metrics.record(&result("a", RoutingMethod::Pattern, 1.0), 0);
        metrics.record(&result("a", RoutingMethod::Fallback, 0.0), 0);

        let snap = metrics.snapshot();
        assert_eq!(snap.total.confidence_buckets, [1, 0, 1, 0, 2]);
        assert_eq!(snap.per_method["pattern"].confidence_buckets, [0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_avg_confidence() {
        let metrics = RoutingMetrics::new();
        metrics.record(&result("a", RoutingMethod::Pattern, 1.0), 0);
        metrics.record(&result("a", RoutingMethod::Pattern, 0.5), 0);
        let snap = metrics.snapshot();
        assert!((snap.total.avg_confidence() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_empty_counter_avg_is_zero() {
        assert_eq!(Counter::default().avg_confidence(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = RoutingMetrics::new();
        metrics.record(&result("a", RoutingMethod::Fallback, 0.5), 1);
        let snap = metrics.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("fallback"));
    }
}
