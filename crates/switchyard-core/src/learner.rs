//! Decision learning layer
//!
//! Wraps the routing chain with an append-only (bounded) decision log and
//! per-method performance aggregates. Once enough history exists, similar
//! past queries can override the chain's base decision when another agent
//! has clearly performed better. Learning failures never affect request
//! handling; the base decision is returned unchanged.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chain::RoutingChain;
use crate::types::{IntentResult, LearnedOverride, RouteRequest, RoutingMethod};

/// Maximum retained decisions before the oldest are evicted
const LOG_CAPACITY: usize = 1000;
/// Bounded window of recent satisfaction samples per routing method
const SATISFACTION_WINDOW: usize = 50;

/// Outcome fields filled in by later feedback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub success: Option<bool>,
    /// 1..=5 when present
    pub satisfaction: Option<f64>,
    pub resolution_time_secs: Option<f64>,
    pub escalated: bool,
}

/// One logged routing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: String,
    pub session_id: String,
    pub query: String,
    pub selected_agent: String,
    pub method: RoutingMethod,
    pub confidence: f64,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub outcome: DecisionOutcome,
}

/// Aggregate counters per routing method
#[derive(Debug, Clone, Default, Serialize)]
pub struct MethodMetrics {
    pub requests: u64,
    pub successes: u64,
    pub total_confidence: f64,
    pub total_latency_ms: u64,
    /// Most recent satisfaction scores, bounded
    pub recent_satisfaction: VecDeque<f64>,
}

impl MethodMetrics {
    fn record_request(&mut self, confidence: f64, latency_ms: u64) {
        self.requests += 1;
        self.total_confidence += confidence;
        self.total_latency_ms += latency_ms;
    }

    fn record_satisfaction(&mut self, score: f64) {
        if self.recent_satisfaction.len() >= SATISFACTION_WINDOW {
            self.recent_satisfaction.pop_front();
        }
        self.recent_satisfaction.push_back(score);
    }

    pub fn avg_confidence(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_confidence / self.requests as f64
        }
    }
}

/// Typed feedback events attached to a logged decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Feedback {
    /// 1..=5
    Satisfaction(f64),
    Success(bool),
    ResolutionTime(f64),
    Escalated,
}

/// Tuning knobs for the override pass
#[derive(Debug, Clone)]
pub struct LearnerConfig {
    /// Minimum log size before overrides are considered
    pub min_history: usize,
    /// Word-overlap similarity threshold for "similar" queries
    pub similarity_threshold: f64,
    /// Trailing window for similar-decision lookup
    pub window: ChronoDuration,
    /// Minimum similar decisions per candidate agent
    pub min_samples: usize,
    /// Composite score required to override the base decision
    pub override_threshold: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            min_history: 10,
            similarity_threshold: 0.7,
            window: ChronoDuration::hours(24),
            min_samples: 2,
            override_threshold: 0.7,
        }
    }
}

#[derive(Default)]
struct LearnerState {
    log: VecDeque<RoutingDecision>,
    metrics: HashMap<RoutingMethod, MethodMetrics>,
}

/// The learning wrapper around the routing chain
pub struct DecisionLearner {
    chain: RoutingChain,
    config: LearnerConfig,
    // Short, await-free critical sections only
    state: Mutex<LearnerState>,
}

impl DecisionLearner {
    pub fn new(chain: RoutingChain) -> Self {
        Self::with_config(chain, LearnerConfig::default())
    }

    pub fn with_config(chain: RoutingChain, config: LearnerConfig) -> Self {
        Self {
            chain,
            config,
            state: Mutex::new(LearnerState::default()),
        }
    }

    /// Route through the chain, then apply the learning pass and log the
    /// final decision.
    pub async fn route(&self, request: &RouteRequest) -> IntentResult {
        let started = Instant::now();
        let base = self.chain.route(request).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut state = self.state.lock().expect("learner state poisoned");

        let result = match apply_override(&state, &self.config, &request.prompt, base.clone()) {
            Ok(result) => result,
            Err(e) => {
                warn!("Learning pass failed, keeping base decision: {}", e);
                base
            }
        };

        let decision = RoutingDecision {
            id: Uuid::new_v4().to_string(),
            session_id: request.session_id.clone(),
            query: request.prompt.clone(),
            selected_agent: result.selected_agent.clone(),
            method: result.method,
            confidence: result.confidence,
            latency_ms,
            timestamp: Utc::now(),
            outcome: DecisionOutcome::default(),
        };

        if state.log.len() >= LOG_CAPACITY {
            state.log.pop_front();
        }
        state.log.push_back(decision);

        state
            .metrics
            .entry(result.method)
            .or_default()
            .record_request(result.confidence, latency_ms);

        result
    }

    /// Attach feedback to a logged decision and fold it into the aggregates
    /// for that decision's routing method.
    pub fn record_feedback(&self, decision_id: &str, feedback: Feedback) -> Result<()> {
        let mut state = self.state.lock().expect("learner state poisoned");

        let decision = state
            .log
            .iter_mut()
            .find(|d| d.id == decision_id)
            .ok_or_else(|| anyhow!("Unknown decision id: {decision_id}"))?;

        let method = decision.method;
        match feedback {
            Feedback::Satisfaction(score) => {
                decision.outcome.satisfaction = Some(score.clamp(1.0, 5.0));
            }
            Feedback::Success(ok) => decision.outcome.success = Some(ok),
            Feedback::ResolutionTime(secs) => {
                decision.outcome.resolution_time_secs = Some(secs.max(0.0));
            }
            Feedback::Escalated => decision.outcome.escalated = true,
        }

        let metrics = state.metrics.entry(method).or_default();
        match feedback {
            Feedback::Satisfaction(score) => metrics.record_satisfaction(score.clamp(1.0, 5.0)),
            Feedback::Success(true) => metrics.successes += 1,
            _ => {}
        }

        Ok(())
    }

    /// Id of the most recently logged decision, if any.
    pub fn last_decision_id(&self) -> Option<String> {
        let state = self.state.lock().expect("learner state poisoned");
        state.log.back().map(|d| d.id.clone())
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().expect("learner state poisoned").log.len()
    }

    pub fn method_metrics(&self) -> HashMap<RoutingMethod, MethodMetrics> {
        self.state
            .lock()
            .expect("learner state poisoned")
            .metrics
            .clone()
    }
}

/// Word-overlap (Jaccard) similarity between two queries.
fn similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let words_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count() as f64;
    let union = words_a.union(&words_b).count() as f64;
    intersection / union
}

struct AgentSample {
    count: usize,
    successes: usize,
    success_known: usize,
    satisfaction_sum: f64,
    satisfaction_count: usize,
    confidence_sum: f64,
    resolution_sum: f64,
    resolution_count: usize,
}

impl AgentSample {
    fn new() -> Self {
        Self {
            count: 0,
            successes: 0,
            success_known: 0,
            satisfaction_sum: 0.0,
            satisfaction_count: 0,
            confidence_sum: 0.0,
            resolution_sum: 0.0,
            resolution_count: 0,
        }
    }

    /// Composite = 0.4·success_rate + 0.3·(satisfaction/5) + 0.2·confidence
    /// + 0.1·resolution-speed, each normalized to [0, 1].
    fn composite_score(&self) -> f64 {
        let success_rate = if self.success_known > 0 {
            self.successes as f64 / self.success_known as f64
        } else {
            0.5
        };
        let avg_satisfaction = if self.satisfaction_count > 0 {
            self.satisfaction_sum / self.satisfaction_count as f64
        } else {
            3.0
        };
        let avg_confidence = self.confidence_sum / self.count.max(1) as f64;
        // Resolution speed: 5 minutes or less scores near 1, decaying beyond
        let resolution_speed = if self.resolution_count > 0 {
            let avg_secs = self.resolution_sum / self.resolution_count as f64;
            1.0 / (1.0 + avg_secs / 300.0)
        } else {
            0.5
        };

        0.4 * success_rate
            + 0.3 * (avg_satisfaction / 5.0)
            + 0.2 * avg_confidence
            + 0.1 * resolution_speed
    }
}

fn apply_override(
    state: &LearnerState,
    config: &LearnerConfig,
    query: &str,
    mut base: IntentResult,
) -> Result<IntentResult> {
    if state.log.len() < config.min_history {
        return Ok(base);
    }

    let cutoff = Utc::now() - config.window;
    let mut samples: HashMap<String, AgentSample> = HashMap::new();

    for decision in state.log.iter().rev() {
        if decision.timestamp < cutoff {
            break;
        }
        if similarity(query, &decision.query) < config.similarity_threshold {
            continue;
        }
        let sample = samples
            .entry(decision.selected_agent.clone())
            .or_insert_with(AgentSample::new);
        sample.count += 1;
        sample.confidence_sum += decision.confidence;
        if let Some(success) = decision.outcome.success {
            sample.success_known += 1;
            if success {
                sample.successes += 1;
            }
        }
        if let Some(score) = decision.outcome.satisfaction {
            sample.satisfaction_sum += score;
            sample.satisfaction_count += 1;
        }
        if let Some(secs) = decision.outcome.resolution_time_secs {
            sample.resolution_sum += secs;
            sample.resolution_count += 1;
        }
    }

    let best = samples
        .iter()
        .filter(|(_, s)| s.count >= config.min_samples)
        .map(|(agent, s)| (agent, s.composite_score()))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    if let Some((agent, score)) = best {
        if agent != &base.selected_agent && score >= config.override_threshold {
            debug!(
                "Learned override: '{}' -> '{}' (score {:.2})",
                base.selected_agent, agent, score
            );
            base.learned_override = Some(LearnedOverride {
                original_agent: base.selected_agent.clone(),
                score,
            });
            base.selected_agent = agent.clone();
        }
    }

    Ok(base)
}
