//! switchyard-core - The routing brain of switchyard
//!
//! This crate provides:
//! - Rule-driven pattern matching with priority ordering and tie-breaking
//! - LLM-backed intent classification with a confidence-gated fallback pair
//! - A chain-of-responsibility pipeline that always terminates in a decision
//! - A decision learner that overrides routing from historical outcomes
//! - Conversational context tracking with session and user profiles
//! - Per-stage TTL caching and in-process routing metrics

pub mod cache;
pub mod chain;
pub mod classifier;
pub mod completion;
pub mod context;
pub mod learner;
pub mod metrics;
pub mod pattern;
pub mod router;
pub mod rules;
pub mod types;

// Re-export main types for convenience
pub use cache::{CacheTtls, StageCache};
pub use chain::{FallbackStage, RouteStage, RoutingChain};
pub use classifier::{default_agent_types, FallbackClassifier, IntentClassifier};
pub use completion::{CompletionClient, CompletionResponse, HttpCompletion, StaticCompletion};
pub use context::{ContextTracker, ConversationContext, UserProfile};
pub use learner::{DecisionLearner, Feedback, LearnerConfig, RoutingDecision};
pub use metrics::{MetricsSnapshot, RoutingMetrics};
pub use pattern::{KeywordTieBreak, PatternMatcher, TieBreakPolicy};
pub use router::{Router, RouterBuilder};
pub use rules::{RoutingRule, RuleSet};
pub use types::{
    Enhancement, HistoryMessage, IntentResult, LearnedOverride, RouteRequest, RoutingMethod,
};
