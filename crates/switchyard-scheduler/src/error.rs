//! Scheduler error taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No agent can satisfy capabilities {0:?}")]
    NoCapableAgent(Vec<String>),

    #[error("Task {0} timed out")]
    Timeout(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Agent {0} is not available")]
    AgentUnavailable(String),

    #[error("Execution failed: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
