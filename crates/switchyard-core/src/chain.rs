//! Chain-of-responsibility over the routing stages
//!
//! Stages run in fixed order; the first one returning a decision wins. The
//! terminal fallback stage always answers, so every request gets a decision.
//! Stage outputs flow through the shared per-stage cache.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::cache::StageCache;
use crate::classifier::{FallbackClassifier, IntentClassifier};
use crate::pattern::PatternMatcher;
use crate::types::{IntentResult, RouteRequest, RoutingMethod, AGENT_GENERAL};

/// A single stage in the routing chain.
///
/// `evaluate` returns `None` to defer to the next stage. Stages isolate their
/// own failures; they never return errors.
#[async_trait]
pub trait RouteStage: Send + Sync {
    fn method(&self) -> RoutingMethod;
    async fn evaluate(&self, request: &RouteRequest) -> Option<IntentResult>;
}

#[async_trait]
impl RouteStage for PatternMatcher {
    fn method(&self) -> RoutingMethod {
        RoutingMethod::Pattern
    }

    async fn evaluate(&self, request: &RouteRequest) -> Option<IntentResult> {
        PatternMatcher::evaluate(self, &request.prompt)
    }
}

#[async_trait]
impl RouteStage for IntentClassifier {
    fn method(&self) -> RoutingMethod {
        RoutingMethod::Classifier
    }

    async fn evaluate(&self, request: &RouteRequest) -> Option<IntentResult> {
        IntentClassifier::evaluate(self, request).await
    }
}

#[async_trait]
impl RouteStage for FallbackClassifier {
    fn method(&self) -> RoutingMethod {
        RoutingMethod::FallbackClassifier
    }

    async fn evaluate(&self, request: &RouteRequest) -> Option<IntentResult> {
        FallbackClassifier::evaluate(self, request).await
    }
}

/// Terminal stage: always routes to the default agent with confidence 0.5.
pub struct FallbackStage {
    default_agent: String,
}

impl FallbackStage {
    pub fn new(default_agent: impl Into<String>) -> Self {
        Self {
            default_agent: default_agent.into(),
        }
    }
}

impl Default for FallbackStage {
    fn default() -> Self {
        Self::new(AGENT_GENERAL)
    }
}

#[async_trait]
impl RouteStage for FallbackStage {
    fn method(&self) -> RoutingMethod {
        RoutingMethod::Fallback
    }

    async fn evaluate(&self, _request: &RouteRequest) -> Option<IntentResult> {
        Some(IntentResult::new(
            "general_query",
            0.5,
            RoutingMethod::Fallback,
            self.default_agent.clone(),
        ))
    }
}

/// Fixed-order stage pipeline with a guaranteed terminal decision
pub struct RoutingChain {
    stages: Vec<Box<dyn RouteStage>>,
    cache: Arc<StageCache>,
    default_agent: String,
}

impl RoutingChain {
    pub fn new(stages: Vec<Box<dyn RouteStage>>, cache: Arc<StageCache>) -> Self {
        Self {
            stages,
            cache,
            default_agent: AGENT_GENERAL.to_string(),
        }
    }

    /// The standard four-stage pipeline: pattern, classifier, fallback
    /// classifier, terminal fallback.
    pub fn standard(
        pattern: PatternMatcher,
        classifier: IntentClassifier,
        fallback_classifier: FallbackClassifier,
        cache: Arc<StageCache>,
    ) -> Self {
        Self::new(
            vec![
                Box::new(pattern),
                Box::new(classifier),
                Box::new(fallback_classifier),
                Box::new(FallbackStage::default()),
            ],
            cache,
        )
    }

    /// Run the chain. Never fails; the fallback stage (or the chain's own
    /// default, if the stage list was built without one) always answers.
    pub async fn route(&self, request: &RouteRequest) -> IntentResult {
        for stage in &self.stages {
            let method = stage.method();
            if let Some(cached) = self.cache.get(&request.prompt, &request.user_id, method) {
                return cached;
            }
            if let Some(result) = stage.evaluate(request).await {
                debug!(
                    "Stage {} decided: agent '{}' ({:.2})",
                    method, result.selected_agent, result.confidence
                );
                self.cache.put(&request.prompt, &request.user_id, &result);
                return result;
            }
        }

        IntentResult::new(
            "general_query",
            0.5,
            RoutingMethod::Fallback,
            self.default_agent.clone(),
        )
    }
}
