//! Agent model: capabilities, status, metrics, and the executor trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Smoothing factor for the execution-time EMA
pub const EXECUTION_EMA_ALPHA: f64 = 0.1;

/// One thing an agent can do, with a quality score and a relative cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    /// 0..=1, how well the agent performs this capability
    pub performance_score: f64,
    /// Relative cost of invoking it
    pub cost: f64,
}

impl Capability {
    pub fn new(name: impl Into<String>, performance_score: f64, cost: f64) -> Self {
        Self {
            name: name.into(),
            performance_score: performance_score.clamp(0.0, 1.0),
            cost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Offline,
    Error,
}

/// Rolling execution statistics for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// 0..=1 over completed + failed
    pub success_rate: f64,
    /// EMA of execution time in milliseconds
    pub avg_execution_ms: f64,
    pub completed: u64,
    pub failed: u64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            avg_execution_ms: 0.0,
            completed: 0,
            failed: 0,
        }
    }
}

impl AgentMetrics {
    /// Fold one finished execution into the rolling stats.
    pub fn record_execution(&mut self, elapsed_ms: f64, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        let total = self.completed + self.failed;
        self.success_rate = self.completed as f64 / total as f64;

        if self.avg_execution_ms == 0.0 {
            self.avg_execution_ms = elapsed_ms;
        } else {
            self.avg_execution_ms = EXECUTION_EMA_ALPHA * elapsed_ms
                + (1.0 - EXECUTION_EMA_ALPHA) * self.avg_execution_ms;
        }
    }
}

/// Registry entry for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub capabilities: Vec<Capability>,
    pub status: AgentStatus,
    pub current_load: usize,
    pub max_concurrent: usize,
    pub metrics: AgentMetrics,
    /// 0..=1, decayed by the health monitor when idle
    pub health: f64,
    pub last_active: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: Vec<Capability>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities,
            status: AgentStatus::Available,
            current_load: 0,
            max_concurrent: max_concurrent.max(1),
            metrics: AgentMetrics::default(),
            health: 1.0,
            last_active: Utc::now(),
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    /// True when every required capability is present.
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.has_capability(r))
    }

    pub fn has_headroom(&self) -> bool {
        self.current_load < self.max_concurrent
    }

    /// Fraction of capacity still free, 0..=1.
    pub fn headroom(&self) -> f64 {
        1.0 - self.current_load as f64 / self.max_concurrent as f64
    }
}

/// How an executor delivers its result
pub enum AgentOutcome {
    /// Single final value
    Complete(Value),
    /// Incremental values over a bounded channel; closed when finished
    Stream(mpsc::Receiver<Value>),
}

/// The work an agent actually performs.
///
/// Implementations run inside the dispatcher under a timeout and a
/// cancellation token; they should return promptly once input is handled.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn handle(&self, input: Value, context: Value) -> anyhow::Result<AgentOutcome>;
}
