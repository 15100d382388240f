//! LLM-backed intent classification stages
//!
//! The primary classifier builds a structured prompt (task description, worked
//! examples, required JSON schema) and gates on a confidence threshold. The
//! fallback classifier uses a simpler prompt with no gate. Both demote every
//! failure — transport errors, malformed replies, low confidence — to "no
//! decision" so the chain always proceeds.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::completion::{CompletionClient, ResponseFormat};
use crate::types::{IntentResult, RouteRequest, RoutingMethod, AGENT_GENERAL};

const CLASSIFY_SYSTEM: &str =
    "You are a routing classifier for a customer assistance platform. Output only valid JSON.";

/// Parsed shape of the classifier's reply
#[derive(Debug, Deserialize)]
struct Classification {
    agent_type: String,
    intent: String,
    confidence: f64,
    #[allow(dead_code)]
    #[serde(default)]
    reasoning: String,
}

/// Primary LLM classifier with a confidence gate
pub struct IntentClassifier {
    completion: Arc<dyn CompletionClient>,
    /// Replies below this confidence defer to the next stage
    pub threshold: f64,
    agent_types: Vec<String>,
}

impl IntentClassifier {
    pub fn new(completion: Arc<dyn CompletionClient>, agent_types: Vec<String>) -> Self {
        Self {
            completion,
            threshold: 0.8,
            agent_types,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    fn build_prompt(&self, query: &str) -> String {
        format!(
            r#"Classify this request and pick the agent best suited to handle it.

Available agents: {agents}

Examples:
- "my rent went up without notice" -> {{"agent_type": "lease", "intent": "lease_inquiry", "confidence": 0.93, "reasoning": "rent terms are a lease matter"}}
- "the app keeps crashing when I open it" -> {{"agent_type": "support", "intent": "technical_support", "confidence": 0.95, "reasoning": "software malfunction"}}
- "I was charged twice this month" -> {{"agent_type": "billing", "intent": "billing_inquiry", "confidence": 0.9, "reasoning": "duplicate charge"}}

Request: {query}

Respond with JSON matching exactly this schema:
{{"agent_type": "<one of the available agents>", "intent": "<snake_case label>", "confidence": <0.0-1.0>, "reasoning": "<one sentence>"}}"#,
            agents = self.agent_types.join(", "),
            query = query
        )
    }

    /// Classify the request. `None` means "no decision", never an error.
    pub async fn evaluate(&self, request: &RouteRequest) -> Option<IntentResult> {
        let prompt = self.build_prompt(&request.prompt);
        let reply = match self
            .completion
            .complete(
                &prompt,
                CLASSIFY_SYSTEM,
                request.sampling.temperature,
                ResponseFormat::Json,
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Classifier completion failed, deferring: {}", e);
                return None;
            }
        };

        let parsed = match parse_classification(&reply.content) {
            Ok(c) => c,
            Err(e) => {
                warn!("Classifier reply unparseable, deferring: {}", e);
                return None;
            }
        };

        if parsed.confidence < self.threshold {
            debug!(
                "Classifier confidence {:.2} below threshold {:.2}, deferring",
                parsed.confidence, self.threshold
            );
            return None;
        }

        Some(IntentResult::new(
            parsed.intent,
            parsed.confidence,
            RoutingMethod::Classifier,
            parsed.agent_type,
        ))
    }
}

/// Secondary classifier: simpler prompt, no confidence gate.
///
/// Only consulted when the primary classifier deferred.
pub struct FallbackClassifier {
    completion: Arc<dyn CompletionClient>,
    agent_types: Vec<String>,
}

impl FallbackClassifier {
    pub fn new(completion: Arc<dyn CompletionClient>, agent_types: Vec<String>) -> Self {
        Self {
            completion,
            agent_types,
        }
    }

    pub async fn evaluate(&self, request: &RouteRequest) -> Option<IntentResult> {
        let prompt = format!(
            "Pick one agent from [{agents}] for this request and respond with JSON \
             {{\"agent_type\": \"...\", \"intent\": \"...\", \"confidence\": 0.0}}.\n\nRequest: {query}",
            agents = self.agent_types.join(", "),
            query = request.prompt
        );

        let reply = match self
            .completion
            .complete(
                &prompt,
                CLASSIFY_SYSTEM,
                request.sampling.temperature,
                ResponseFormat::Json,
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Fallback classifier completion failed, deferring: {}", e);
                return None;
            }
        };

        match parse_classification(&reply.content) {
            Ok(parsed) => Some(IntentResult::new(
                parsed.intent,
                parsed.confidence,
                RoutingMethod::FallbackClassifier,
                parsed.agent_type,
            )),
            Err(e) => {
                warn!("Fallback classifier reply unparseable, deferring: {}", e);
                None
            }
        }
    }
}

/// Parse the model's JSON reply, tolerating preamble text around the object.
fn parse_classification(text: &str) -> Result<Classification> {
    let start = text.find('{').context("No JSON object found in reply")?;
    let end = text.rfind('}').context("No closing brace found in reply")?;
    let json_str = &text[start..=end];

    let parsed: Classification =
        serde_json::from_str(json_str).context("Failed to parse classification JSON")?;

    if parsed.agent_type.trim().is_empty() {
        anyhow::bail!("Classification has empty agent_type");
    }

    Ok(Classification {
        confidence: parsed.confidence.clamp(0.0, 1.0),
        ..parsed
    })
}

/// The default agent list offered to the classifiers.
pub fn default_agent_types() -> Vec<String> {
    vec![
        "lease".to_string(),
        "support".to_string(),
        "billing".to_string(),
        AGENT_GENERAL.to_string(),
    ]
}
