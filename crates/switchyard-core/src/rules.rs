//! Routing rules for the deterministic pattern stage
//!
//! Rules are compiled and validated once at startup and immutable afterwards.
//! A rule pairs a case-insensitive regex with a target agent type, an intent
//! label, and an integer priority (higher wins).

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

/// A single immutable routing rule
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub pattern: Regex,
    pub agent_type: String,
    pub intent: String,
    pub priority: i32,
}

impl RoutingRule {
    pub fn new(
        pattern: &str,
        agent_type: impl Into<String>,
        intent: impl Into<String>,
        priority: i32,
    ) -> Result<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("Invalid routing rule pattern: {pattern}"))?;
        Ok(Self {
            pattern,
            agent_type: agent_type.into(),
            intent: intent.into(),
            priority,
        })
    }

    pub fn matches(&self, query: &str) -> bool {
        self.pattern.is_match(query)
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    pattern: String,
    agent_type: String,
    intent: String,
    #[serde(default)]
    priority: i32,
}

/// The full rule table, sorted by descending priority at load time
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<RoutingRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    /// The default rule table used when no rules file is configured.
    pub fn builtin() -> Self {
        let rules = vec![
            RoutingRule::new(
                r"security deposit|lease (agreement|term|renewal)|rent increase|move[- ]out",
                "lease",
                "lease_inquiry",
                10,
            ),
            RoutingRule::new(
                r"(?:my|the) lease\b|landlord|tenant|subletting",
                "lease",
                "lease_inquiry",
                8,
            ),
            RoutingRule::new(
                r"not working|broken|error (code|message)|can't log ?in|reset (my )?password|outage",
                "support",
                "technical_support",
                10,
            ),
            RoutingRule::new(
                r"wifi|thermostat|smart lock|keypad|app (crash|freeze)",
                "support",
                "technical_support",
                8,
            ),
            RoutingRule::new(
                r"invoice|refund|overcharge|payment (failed|declined)|billing",
                "billing",
                "billing_inquiry",
                9,
            ),
            RoutingRule::new(r"^(hi|hello|hey)\b", "general", "greeting", 2),
        ];
        let rules = rules
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .expect("builtin routing rules must compile");
        Self::new(rules)
    }

    /// Parse rules from a TOML document. Any invalid pattern fails the load.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: RuleFile = toml::from_str(contents).context("Failed to parse rules TOML")?;
        let rules = file
            .rules
            .into_iter()
            .map(|e| RoutingRule::new(&e.pattern, e.agent_type, e.intent, e.priority))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// All rules matching the query, in descending priority order.
    pub fn matching<'a>(&'a self, query: &str) -> Vec<&'a RoutingRule> {
        self.rules.iter().filter(|r| r.matches(query)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_compile_and_sort() {
        let rules = RuleSet::builtin();
        assert!(!rules.is_empty());
        let priorities: Vec<i32> = rules.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn test_security_deposit_matches_lease() {
        let rules = RuleSet::builtin();
        let matches = rules.matching("I need help with my security deposit return");
        assert!(!matches.is_empty());
        assert_eq!(matches[0].agent_type, "lease");
        assert_eq!(matches[0].intent, "lease_inquiry");
        assert_eq!(matches[0].priority, 10);
    }

    #[test]
    fn test_case_insensitive_matching() {
        let rules = RuleSet::builtin();
        let matches = rules.matching("My THERMOSTAT is acting up");
        assert!(matches.iter().any(|r| r.agent_type == "support"));
    }

    #[test]
    fn test_no_match_for_gibberish() {
        let rules = RuleSet::builtin();
        assert!(rules.matching("abcdefghijklmnop").is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(RoutingRule::new("([unclosed", "x", "y", 1).is_err());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            [[rules]]
            pattern = "parking"
            agent_type = "lease"
            intent = "parking_inquiry"
            priority = 5

            [[rules]]
            pattern = "elevator"
            agent_type = "support"
            intent = "technical_support"
            priority = 7
        "#;
        let rules = RuleSet::from_toml(toml).unwrap();
        assert_eq!(rules.len(), 2);
        // Sorted descending by priority
        assert_eq!(rules.iter().next().unwrap().agent_type, "support");
    }

    #[test]
    fn test_from_toml_invalid_pattern() {
        let toml = r#"
            [[rules]]
            pattern = "(broken"
            agent_type = "x"
            intent = "y"
            priority = 1
        "#;
        assert!(RuleSet::from_toml(toml).is_err());
    }
}
