//! Deterministic pattern-matching stage
//!
//! Collects every matching rule, keeps the highest-priority group, and applies
//! a pluggable tie-break policy when several rules of equal priority match.
//! A pattern hit is authoritative: confidence is always 1.0.

use tracing::debug;

use crate::rules::{RoutingRule, RuleSet};
use crate::types::{IntentResult, RoutingMethod};

/// Resolves ties among equal-priority rule matches.
///
/// The default policy carries domain phrase lists; callers with different
/// domains swap in their own.
pub trait TieBreakPolicy: Send + Sync {
    /// Pick the winner among `candidates` (all same priority, all matched).
    /// Returning `None` keeps the first candidate.
    fn resolve<'a>(&self, query: &str, candidates: &[&'a RoutingRule]) -> Option<&'a RoutingRule>;
}

/// Default tie-break: when technical-system keywords co-occur with lease
/// keywords, the support match wins over the lease match.
#[derive(Debug, Default)]
pub struct KeywordTieBreak;

const TECHNICAL_KEYWORDS: &[&str] = &[
    "error", "broken", "not working", "offline", "outage", "crash", "reset", "log in", "login",
    "wifi", "thermostat", "keypad", "app",
];

impl TieBreakPolicy for KeywordTieBreak {
    fn resolve<'a>(&self, query: &str, candidates: &[&'a RoutingRule]) -> Option<&'a RoutingRule> {
        let lower = query.to_lowercase();
        let has_technical = TECHNICAL_KEYWORDS.iter().any(|k| lower.contains(k));
        if !has_technical {
            return None;
        }

        let has_lease_candidate = candidates.iter().any(|r| r.agent_type == "lease");
        let support = candidates.iter().find(|r| r.agent_type == "support");
        if has_lease_candidate {
            if let Some(rule) = support {
                debug!("Tie-break: technical keywords present, preferring support over lease");
                return Some(rule);
            }
        }
        None
    }
}

/// The first stage of the routing chain
pub struct PatternMatcher {
    rules: RuleSet,
    tie_break: Box<dyn TieBreakPolicy>,
}

impl PatternMatcher {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            tie_break: Box::new(KeywordTieBreak),
        }
    }

    pub fn with_tie_break(mut self, policy: Box<dyn TieBreakPolicy>) -> Self {
        self.tie_break = policy;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Match `query` against the rule table. `None` defers to the next stage.
    pub fn evaluate(&self, query: &str) -> Option<IntentResult> {
        let matches = self.rules.matching(query);
        if matches.is_empty() {
            return None;
        }

        // matching() preserves descending priority order
        let top_priority = matches[0].priority;
        let top: Vec<&RoutingRule> = matches
            .iter()
            .copied()
            .take_while(|r| r.priority == top_priority)
            .collect();

        let winner = if top.len() > 1 {
            self.tie_break.resolve(query, &top).unwrap_or(top[0])
        } else {
            top[0]
        };

        debug!(
            "Pattern match: {} candidates, selected agent '{}' (intent '{}')",
            matches.len(),
            winner.agent_type,
            winner.intent
        );

        Some(IntentResult::new(
            winner.intent.clone(),
            1.0,
            RoutingMethod::Pattern,
            winner.agent_type.clone(),
        ))
    }
}
