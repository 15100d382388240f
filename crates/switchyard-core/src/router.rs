//! Router facade
//!
//! Wires the routing chain, decision learner, context tracker, stage cache
//! and metrics into one entry point. All collaborators are injected at
//! construction; there is no global state.

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::cache::{CacheTtls, StageCache};
use crate::chain::{FallbackStage, RoutingChain};
use crate::classifier::{default_agent_types, FallbackClassifier, IntentClassifier};
use crate::completion::CompletionClient;
use crate::context::{ContextTracker, ConversationContext, UserProfile};
use crate::learner::{DecisionLearner, Feedback, LearnerConfig};
use crate::metrics::{MetricsSnapshot, RoutingMetrics};
use crate::pattern::PatternMatcher;
use crate::rules::RuleSet;
use crate::types::{IntentResult, RouteRequest, AGENT_GENERAL};

pub struct Router {
    tracker: ContextTracker,
    metrics: Arc<RoutingMetrics>,
}

/// Step-by-step construction with sensible defaults for everything but the
/// completion backend.
pub struct RouterBuilder {
    completion: Arc<dyn CompletionClient>,
    rules: RuleSet,
    agent_types: Vec<String>,
    cache_capacity: usize,
    ttls: CacheTtls,
    learner_config: LearnerConfig,
    classifier_threshold: f64,
    default_agent: String,
}

impl RouterBuilder {
    pub fn new(completion: Arc<dyn CompletionClient>) -> Self {
        Self {
            completion,
            rules: RuleSet::builtin(),
            agent_types: default_agent_types(),
            cache_capacity: 1024,
            ttls: CacheTtls::default(),
            learner_config: LearnerConfig::default(),
            classifier_threshold: 0.8,
            default_agent: AGENT_GENERAL.to_string(),
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_agent_types(mut self, agent_types: Vec<String>) -> Self {
        self.agent_types = agent_types;
        self
    }

    pub fn with_cache(mut self, capacity: usize, ttls: CacheTtls) -> Self {
        self.cache_capacity = capacity;
        self.ttls = ttls;
        self
    }

    pub fn with_learner_config(mut self, config: LearnerConfig) -> Self {
        self.learner_config = config;
        self
    }

    pub fn with_classifier_threshold(mut self, threshold: f64) -> Self {
        self.classifier_threshold = threshold;
        self
    }

    /// Agent the terminal fallback stage routes to.
    pub fn with_default_agent(mut self, agent: impl Into<String>) -> Self {
        self.default_agent = agent.into();
        self
    }

    pub fn build(self) -> Router {
        let cache = Arc::new(StageCache::new(self.cache_capacity, self.ttls));
        let chain = RoutingChain::new(
            vec![
                Box::new(PatternMatcher::new(self.rules)),
                Box::new(
                    IntentClassifier::new(self.completion.clone(), self.agent_types.clone())
                        .with_threshold(self.classifier_threshold),
                ),
                Box::new(FallbackClassifier::new(self.completion, self.agent_types)),
                Box::new(FallbackStage::new(self.default_agent)),
            ],
            cache,
        );
        let learner = DecisionLearner::with_config(chain, self.learner_config);
        Router {
            tracker: ContextTracker::new(learner),
            metrics: Arc::new(RoutingMetrics::new()),
        }
    }
}

impl Router {
    pub fn builder(completion: Arc<dyn CompletionClient>) -> RouterBuilder {
        RouterBuilder::new(completion)
    }

    /// Route one request. Always terminates with a decision: confidence in
    /// [0, 1] and a non-empty agent.
    pub async fn route(&self, request: &RouteRequest) -> IntentResult {
        let started = Instant::now();
        let result = self.tracker.route(request).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.record(&result, latency_ms);
        info!(
            "Routed session {} to '{}' via {} (confidence {:.2}, {}ms)",
            request.session_id, result.selected_agent, result.method, result.confidence, latency_ms
        );
        result
    }

    pub fn record_feedback(&self, decision_id: &str, feedback: Feedback) -> anyhow::Result<()> {
        self.tracker.record_feedback(decision_id, feedback)
    }

    pub fn record_satisfaction(&self, user_id: &str, agent_type: &str, score: f64) {
        self.tracker.record_satisfaction(user_id, agent_type, score);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
        self.tracker.profile(user_id)
    }

    pub fn session(&self, session_id: &str) -> Option<ConversationContext> {
        self.tracker.session(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::StaticCompletion;
    use crate::types::RoutingMethod;

    fn offline_router() -> Router {
        Router::builder(Arc::new(StaticCompletion::new())).build()
    }

    #[tokio::test]
    async fn test_route_always_decides() {
        let router = offline_router();
        let result = router
            .route(&RouteRequest::new("zxqw vvkk", "s1", "u1"))
            .await;
        assert!(!result.selected_agent.is_empty());
        assert!(result.confidence >= 0.0 && result.confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_metrics_reflect_traffic() {
        let router = offline_router();
        router
            .route(&RouteRequest::new(
                "question about my security deposit",
                "s1",
                "u1",
            ))
            .await;
        router
            .route(&RouteRequest::new("zxqw vvkk", "s2", "u2"))
            .await;

        let snap = router.metrics();
        assert_eq!(snap.total.requests, 2);
        assert_eq!(snap.per_method["pattern"].requests, 1);
        assert_eq!(snap.per_method["fallback"].requests, 1);
    }

    #[tokio::test]
    async fn test_satisfaction_reaches_profile() {
        let router = offline_router();
        router.record_satisfaction("u1", "lease", 5.0);
        let profile = router.profile("u1").unwrap();
        assert!(profile.agent_preferences["lease"] > 3.0);
    }

    #[tokio::test]
    async fn test_feedback_unknown_decision_errors() {
        let router = offline_router();
        assert!(router
            .record_feedback("no-such-id", Feedback::Success(true))
            .is_err());
    }

    #[tokio::test]
    async fn test_builder_default_agent_reaches_fallback() {
        let router = Router::builder(Arc::new(StaticCompletion::new()))
            .with_default_agent("support")
            .build();
        let result = router
            .route(&RouteRequest::new("zxqw vvkk", "s1", "u1"))
            .await;
        assert_eq!(result.method, RoutingMethod::Fallback);
        assert_eq!(result.selected_agent, "support");
        assert_eq!(result.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_builder_threshold_applies() {
        let completion = Arc::new(StaticCompletion::with_replies(vec![
            r#"{"agent_type": "billing", "intent": "billing_inquiry", "confidence": 0.6}"#
                .to_string(),
        ]));
        let router = Router::builder(completion).with_classifier_threshold(0.5).build();
        let result = router
            .route(&RouteRequest::new("odd charge text here", "s1", "u1"))
            .await;
        assert_eq!(result.method, RoutingMethod::Classifier);
        assert_eq!(result.selected_agent, "billing");
    }
}
