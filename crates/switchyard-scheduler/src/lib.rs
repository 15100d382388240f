//! switchyard-scheduler - Concurrent task execution for switchyard agents
//!
//! This crate provides:
//! - An agent registry with capability, load, and health accounting
//! - A priority task queue and a cooperative dispatch loop
//! - Pluggable agent selection strategies
//! - A DAG workflow engine with safe step gates
//! - A background health monitor

pub mod agent;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod queue;
pub mod registry;
pub mod strategy;
pub mod task;
pub mod workflow;

// Re-export main types for convenience
pub use agent::{AgentExecutor, AgentMetrics, AgentOutcome, AgentRecord, AgentStatus, Capability};
pub use dispatcher::{DispatcherConfig, TaskDispatcher};
pub use error::{Result, SchedulerError};
pub use health::{HealthConfig, HealthMonitor};
pub use queue::TaskQueue;
pub use registry::AgentRegistry;
pub use strategy::{
    CapabilityMatch, LeastLoaded, PerformanceBased, RoundRobin, SelectionStrategy,
};
pub use task::{Task, TaskSpec, TaskStatus};
pub use workflow::{
    Predicate, PredicateTable, StepGate, StepStatus, Workflow, WorkflowEngine, WorkflowStatus,
    WorkflowStep,
};
