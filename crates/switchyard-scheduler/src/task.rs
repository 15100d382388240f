//! Task model with a monotonic status lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Position in the lifecycle; terminal states share the top rank.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Assigned => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Caller-facing description of work to submit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub input: Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            required_capabilities: Vec::new(),
            input,
            priority: 0,
            timeout_secs: None,
            max_retries: 0,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub required_capabilities: Vec<String>,
    pub input: Value,
    pub priority: i64,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: u32,
    pub retries: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            required_capabilities: spec.required_capabilities,
            input: spec.input,
            priority: spec.priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            timeout_secs: spec.timeout_secs,
            max_retries: spec.max_retries,
            retries: 0,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move the task forward in its lifecycle. Regressions and transitions
    /// out of a terminal state are rejected.
    pub fn advance(&mut self, next: TaskStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(SchedulerError::Execution(format!(
                "Task {} is already {:?}",
                self.id, self.status
            )));
        }
        if next.rank() <= self.status.rank() && next != self.status {
            return Err(SchedulerError::Execution(format!(
                "Task {} cannot move {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Deadline measured from submission; queue wait counts against it.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.timeout_secs
            .map(|secs| self.submitted_at + chrono::Duration::seconds(secs as i64))
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_some_and(|d| now > d)
    }
}
