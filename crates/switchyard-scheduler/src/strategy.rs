//! Agent selection strategies
//!
//! Candidates handed to a strategy are already filtered to available,
//! under-capacity agents covering the task's capabilities; the strategy only
//! ranks them.

use crate::agent::AgentRecord;
use crate::task::Task;

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one agent id from the candidates. `None` only when the slice is
    /// empty.
    fn select(&self, task: &Task, candidates: &[AgentRecord]) -> Option<String>;
}

/// Least-recently active agent first
#[derive(Debug, Default)]
pub struct RoundRobin;

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, _task: &Task, candidates: &[AgentRecord]) -> Option<String> {
        candidates
            .iter()
            .min_by_key(|a| a.last_active)
            .map(|a| a.id.clone())
    }
}

/// Fewest in-flight tasks first
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl SelectionStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&self, _task: &Task, candidates: &[AgentRecord]) -> Option<String> {
        candidates
            .iter()
            .min_by_key(|a| a.current_load)
            .map(|a| a.id.clone())
    }
}

/// Composite of headroom, health, and execution speed. The default strategy.
#[derive(Debug, Default)]
pub struct PerformanceBased;

impl PerformanceBased {
    fn score(agent: &AgentRecord) -> f64 {
        // Unmeasured agents count as fast
        let speed = if agent.metrics.avg_execution_ms > 0.0 {
            1.0 / (1.0 + agent.metrics.avg_execution_ms / 1000.0)
        } else {
            1.0
        };
        0.4 * agent.headroom() + 0.3 * agent.health + 0.3 * speed
    }
}

impl SelectionStrategy for PerformanceBased {
    fn name(&self) -> &'static str {
        "performance_based"
    }

    fn select(&self, _task: &Task, candidates: &[AgentRecord]) -> Option<String> {
        candidates
            .iter()
            .max_by(|a, b| {
                Self::score(a)
                    .partial_cmp(&Self::score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|a| a.id.clone())
    }
}

/// Highest sum of performance scores over the task's required capabilities
#[derive(Debug, Default)]
pub struct CapabilityMatch;

impl CapabilityMatch {
    fn score(agent: &AgentRecord, task: &Task) -> f64 {
        agent
            .capabilities
            .iter()
            .filter(|c| task.required_capabilities.contains(&c.name))
            .map(|c| c.performance_score)
            .sum()
    }
}

impl SelectionStrategy for CapabilityMatch {
    fn name(&self) -> &'static str {
        "capability_match"
    }

    fn select(&self, task: &Task, candidates: &[AgentRecord]) -> Option<String> {
        candidates
            .iter()
            .max_by(|a, b| {
                Self::score(a, task)
                    .partial_cmp(&Self::score(b, task))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|a| a.id.clone())
    }
}
