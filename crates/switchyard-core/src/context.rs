//! Conversational context tracking
//!
//! Wraps the decision learner with per-session and per-user state. Each
//! request produces a set of derived signals (continuity, domain consistency,
//! preference, complexity, temporal factor, escalation risk); exactly one
//! enhancement may then adjust the learner's decision, in a fixed precedence
//! order: continuity, escalation, preference.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use crate::learner::{DecisionLearner, Feedback};
use crate::types::{Enhancement, IntentResult, RouteRequest, AGENT_SUPPORT};

/// Bounded message window per session
const MESSAGE_WINDOW: usize = 50;
/// Bounded satisfaction history per user
const SATISFACTION_HISTORY: usize = 20;
/// Neutral starting preference
const NEUTRAL_PREFERENCE: f64 = 3.0;

const FRUSTRATION_TERMS: &[&str] = &[
    "frustrated",
    "annoyed",
    "ridiculous",
    "unacceptable",
    "terrible",
    "worst",
    "angry",
    "again",
    "still not",
    "third time",
];

const TECHNICAL_TERMS: &[&str] = &[
    "error", "config", "server", "crash", "bug", "reset", "reboot", "firmware", "network",
];

const NEGATIVE_TERMS: &[&str] = &["not", "never", "can't", "won't", "broken", "failed", "wrong"];

/// Domain keyword tables used for consistency detection and expertise
const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "lease",
        &["lease", "rent", "deposit", "landlord", "tenant", "renewal", "move"],
    ),
    (
        "support",
        &["wifi", "password", "login", "app", "thermostat", "lock", "broken", "error"],
    ),
    (
        "billing",
        &["invoice", "charge", "payment", "refund", "bill", "fee"],
    ),
];

/// Per-session conversation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub user_id: String,
    /// Bounded window of message texts
    pub messages: VecDeque<String>,
    /// Agent types that have answered in this session
    pub agents_used: Vec<String>,
    pub escalations: Vec<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ConversationContext {
    fn new(session_id: &str, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            messages: VecDeque::new(),
            agents_used: Vec::new(),
            escalations: Vec::new(),
            started_at: now,
            last_activity: now,
        }
    }

    fn push_message(&mut self, content: &str) {
        if self.messages.len() >= MESSAGE_WINDOW {
            self.messages.pop_front();
        }
        self.messages.push_back(content.to_string());
        self.last_activity = Utc::now();
    }

    fn distinct_agents(&self) -> usize {
        self.agents_used.iter().collect::<HashSet<_>>().len()
    }

    /// The agent this session has settled on, when there is exactly one.
    fn established_agent(&self) -> Option<&str> {
        let distinct: HashSet<&str> = self.agents_used.iter().map(String::as_str).collect();
        if distinct.len() == 1 {
            self.agents_used.first().map(String::as_str)
        } else {
            None
        }
    }
}

/// Per-user learned preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    /// Per-agent preference EMA, 1..=5
    pub agent_preferences: HashMap<String, f64>,
    /// Per-domain expertise, 0..=5
    pub domain_expertise: HashMap<String, f64>,
    pub satisfaction_history: VecDeque<f64>,
    pub interaction_count: u64,
}

impl UserProfile {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            agent_preferences: HashMap::new(),
            domain_expertise: HashMap::new(),
            satisfaction_history: VecDeque::new(),
            interaction_count: 0,
        }
    }

    /// Normalized mean preference, 0..=1. Zero when no preferences exist.
    pub fn preference_score(&self) -> f64 {
        if self.agent_preferences.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.agent_preferences.values().sum();
        (sum / self.agent_preferences.len() as f64) / 5.0
    }

    pub fn top_preference(&self) -> Option<(&str, f64)> {
        self.agent_preferences
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(agent, ema)| (agent.as_str(), *ema))
    }

    /// EMA update: new = old·0.7 + satisfaction·0.3, clamped to [1, 5].
    fn update_preference(&mut self, agent_type: &str, satisfaction: f64) {
        let old = self
            .agent_preferences
            .get(agent_type)
            .copied()
            .unwrap_or(NEUTRAL_PREFERENCE);
        let new = (old * 0.7 + satisfaction * 0.3).clamp(1.0, 5.0);
        self.agent_preferences.insert(agent_type.to_string(), new);

        if self.satisfaction_history.len() >= SATISFACTION_HISTORY {
            self.satisfaction_history.pop_front();
        }
        self.satisfaction_history.push_back(satisfaction);
    }

    fn bump_expertise(&mut self, domain: &str) {
        let entry = self.domain_expertise.entry(domain.to_string()).or_insert(0.0);
        *entry = (*entry + 0.1).min(5.0);
    }
}

/// Signals derived from session and user state for one request
#[derive(Debug, Clone, Serialize)]
pub struct ContextSignals {
    pub continuity: f64,
    pub domain_consistency: f64,
    pub detected_domain: Option<String>,
    pub preference_score: f64,
    /// 1..=5
    pub complexity: u8,
    pub temporal_factor: f64,
    pub escalation_risk: f64,
}

/// The context layer around the decision learner
pub struct ContextTracker {
    learner: DecisionLearner,
    sessions: Mutex<HashMap<String, ConversationContext>>,
    profiles: Mutex<HashMap<String, UserProfile>>,
}

impl ContextTracker {
    pub fn new(learner: DecisionLearner) -> Self {
        Self {
            learner,
            sessions: Mutex::new(HashMap::new()),
            profiles: Mutex::new(HashMap::new()),
        }
    }

    pub fn learner(&self) -> &DecisionLearner {
        &self.learner
    }

    /// Route a request with context enhancement applied on top of the
    /// learner's decision.
    pub async fn route(&self, request: &RouteRequest) -> IntentResult {
        // Update session state and snapshot signals before any await
        let (signals, established) = {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            let ctx = sessions
                .entry(request.session_id.clone())
                .or_insert_with(|| ConversationContext::new(&request.session_id, &request.user_id));
            ctx.push_message(&request.prompt);

            let profiles = self.profiles.lock().expect("profiles mutex poisoned");
            let profile = profiles.get(&request.user_id);
            let signals = derive_signals(ctx, profile, &request.prompt);
            let established = ctx.established_agent().map(String::from);
            (signals, established)
        };

        debug!(
            "Context signals for session {}: continuity={:.2} escalation_risk={:.2} complexity={}",
            request.session_id, signals.continuity, signals.escalation_risk, signals.complexity
        );

        let mut result = self.learner.route(request).await;

        self.apply_enhancement(&mut result, &signals, established.as_deref(), request);

        // Record the final agent and bump the user profile
        {
            let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
            if let Some(ctx) = sessions.get_mut(&request.session_id) {
                ctx.agents_used.push(result.selected_agent.clone());
                if matches!(result.enhancement, Some(Enhancement::Escalation { .. })) {
                    ctx.escalations.push(Utc::now());
                }
            }
        }
        {
            let mut profiles = self.profiles.lock().expect("profiles mutex poisoned");
            let profile = profiles
                .entry(request.user_id.clone())
                .or_insert_with(|| UserProfile::new(&request.user_id));
            profile.interaction_count += 1;
            if let Some(ref domain) = signals.detected_domain {
                profile.bump_expertise(domain);
            }
        }

        result
    }

    /// Exactly one enhancement applies, in fixed precedence order.
    fn apply_enhancement(
        &self,
        result: &mut IntentResult,
        signals: &ContextSignals,
        established: Option<&str>,
        request: &RouteRequest,
    ) {
        // 1. Continuity: keep the session with its established agent
        if signals.continuity > 0.7 {
            if let Some(agent) = established {
                if agent != result.selected_agent {
                    debug!("Continuity enhancement: staying with '{}'", agent);
                    result.enhancement = Some(Enhancement::Continuity {
                        established_agent: agent.to_string(),
                    });
                    result.redirect(agent.to_string(), 0.9);
                    return;
                }
            }
        }

        // 2. Escalation to support
        if signals.escalation_risk > 0.7 && result.selected_agent != AGENT_SUPPORT {
            debug!(
                "Escalation enhancement: risk {:.2}, steering to support",
                signals.escalation_risk
            );
            result.enhancement = Some(Enhancement::Escalation {
                risk: signals.escalation_risk,
            });
            result.redirect(AGENT_SUPPORT, 1.0);
            return;
        }

        // 3. User preference steering
        if signals.preference_score > 0.8 {
            let profiles = self.profiles.lock().expect("profiles mutex poisoned");
            if let Some(profile) = profiles.get(&request.user_id) {
                if let Some((agent, ema)) = profile.top_preference() {
                    if ema > 4.0 && agent != result.selected_agent {
                        debug!("Preference enhancement: steering to '{}' (ema {:.2})", agent, ema);
                        let agent = agent.to_string();
                        result.enhancement = Some(Enhancement::Preference {
                            preferred_agent: agent.clone(),
                            ema,
                        });
                        result.redirect(agent, 0.95);
                    }
                }
            }
        }
    }

    /// Record a satisfaction score for an agent, updating the preference EMA
    /// and the bounded satisfaction history.
    pub fn record_satisfaction(&self, user_id: &str, agent_type: &str, score: f64) {
        let score = score.clamp(1.0, 5.0);
        let mut profiles = self.profiles.lock().expect("profiles mutex poisoned");
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::new(user_id));
        profile.update_preference(agent_type, score);
    }

    /// Forward decision-level feedback to the learner.
    pub fn record_feedback(&self, decision_id: &str, feedback: Feedback) -> anyhow::Result<()> {
        self.learner.record_feedback(decision_id, feedback)
    }

    pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
        self.profiles
            .lock()
            .expect("profiles mutex poisoned")
            .get(user_id)
            .cloned()
    }

    pub fn session(&self, session_id: &str) -> Option<ConversationContext> {
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .get(session_id)
            .cloned()
    }
}

fn count_hits(text: &str, terms: &[&str]) -> usize {
    terms.iter().filter(|t| text.contains(*t)).count()
}

fn derive_signals(
    ctx: &ConversationContext,
    profile: Option<&UserProfile>,
    prompt: &str,
) -> ContextSignals {
    let lower = prompt.to_lowercase();

    // Continuity by distinct agents used so far
    let continuity = match ctx.distinct_agents() {
        0 => 0.0,
        1 => 0.9,
        2 => 0.6,
        _ => 0.3,
    };

    // Domain dominance over the last 5 messages
    let recent: Vec<String> = ctx
        .messages
        .iter()
        .rev()
        .take(5)
        .map(|m| m.to_lowercase())
        .collect();
    let mut domain_counts: HashMap<&str, usize> = HashMap::new();
    for message in &recent {
        for (domain, keywords) in DOMAIN_KEYWORDS {
            *domain_counts.entry(domain).or_insert(0) += count_hits(message, keywords);
        }
    }
    let total_hits: usize = domain_counts.values().sum();
    let (detected_domain, domain_consistency) = if total_hits == 0 {
        (None, 0.0)
    } else {
        let (domain, count) = domain_counts
            .iter()
            .max_by_key(|(_, c)| **c)
            .map(|(d, c)| (*d, *c))
            .unwrap_or(("", 0));
        (Some(domain.to_string()), count as f64 / total_hits as f64)
    };

    let preference_score = profile.map(UserProfile::preference_score).unwrap_or(0.0);

    // Complexity 1..=5
    let mut complexity = 1u8;
    if prompt.len() > 120 {
        complexity += 1;
    }
    let questions = prompt.matches('?').count();
    if questions >= 2 {
        complexity += 1;
    }
    if count_hits(&lower, TECHNICAL_TERMS) >= 2 {
        complexity += 1;
    }
    if count_hits(&lower, NEGATIVE_TERMS) >= 2 {
        complexity += 1;
    }

    // Business-hours and short-session boost
    let now = Utc::now();
    let business_hours = (9..17).contains(&now.hour());
    let session_minutes = (now - ctx.started_at).num_minutes();
    let mut temporal_factor: f64 = 0.5;
    if business_hours {
        temporal_factor += 0.3;
    }
    if session_minutes < 10 {
        temporal_factor += 0.2;
    }

    // Escalation risk: weighted sum, capped at 1.0
    let mut risk = 0.0;
    if !ctx.escalations.is_empty() {
        risk += 0.4;
    }
    let frustration_hits = count_hits(&lower, FRUSTRATION_TERMS);
    risk += 0.3 * (frustration_hits.min(3) as f64 / 3.0);
    if ctx.messages.len() > 10 {
        risk += 0.15;
    }
    if ctx.distinct_agents() >= 2 {
        risk += 0.15;
    }
    let escalation_risk = risk.min(1.0);

    ContextSignals {
        continuity,
        domain_consistency,
        detected_domain,
        preference_score,
        complexity: complexity.min(5),
        temporal_factor,
        escalation_risk,
    }
}
