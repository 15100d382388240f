//! Shared types for switchyard-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default agent type used by the terminal fallback stage.
pub const AGENT_GENERAL: &str = "general";
/// Lease and tenancy questions.
pub const AGENT_LEASE: &str = "lease";
/// Technical support; also the escalation target.
pub const AGENT_SUPPORT: &str = "support";
/// Payments, invoices, refunds.
pub const AGENT_BILLING: &str = "billing";

/// Which pipeline stage produced a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMethod {
    Pattern,
    Classifier,
    FallbackClassifier,
    Fallback,
}

impl std::fmt::Display for RoutingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pattern => write!(f, "pattern"),
            Self::Classifier => write!(f, "classifier"),
            Self::FallbackClassifier => write!(f, "fallback_classifier"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A single message from the conversation history supplied by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sampling parameters forwarded to the text-completion capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 1024,
        }
    }
}

/// An inbound request to be routed to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub prompt: String,
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    pub sampling: SamplingParams,
}

impl RouteRequest {
    pub fn new(
        prompt: impl Into<String>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            history: Vec::new(),
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryMessage>) -> Self {
        self.history = history;
        self
    }
}

/// Set when the decision learner replaced the chain's base decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedOverride {
    /// Agent the chain originally selected
    pub original_agent: String,
    /// Composite score of the overriding agent
    pub score: f64,
}

/// Which conversational-context enhancement was applied (at most one)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Enhancement {
    /// Session stays with its established agent
    Continuity { established_agent: String },
    /// Steered to the support agent due to escalation risk
    Escalation { risk: f64 },
    /// Steered to the user's preferred agent
    Preference { preferred_agent: String, ema: f64 },
}

/// The decision returned by every chain stage and by the router itself.
///
/// Override provenance lives in explicit named fields rather than a free-form
/// metadata map, so callers can match on it without string keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: String,
    /// Always within [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub entities: HashMap<String, String>,
    pub method: RoutingMethod,
    pub selected_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learned_override: Option<LearnedOverride>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancement: Option<Enhancement>,
}

impl IntentResult {
    pub fn new(
        intent: impl Into<String>,
        confidence: f64,
        method: RoutingMethod,
        selected_agent: impl Into<String>,
    ) -> Self {
        Self {
            intent: intent.into(),
            confidence: confidence.clamp(0.0, 1.0),
            entities: HashMap::new(),
            method,
            selected_agent: selected_agent.into(),
            learned_override: None,
            enhancement: None,
        }
    }

    /// Replace the selected agent, scaling confidence by `factor`.
    pub fn redirect(&mut self, agent: impl Into<String>, factor: f64) {
        self.selected_agent = agent.into();
        self.confidence = (self.confidence * factor).clamp(0.0, 1.0);
    }
}
