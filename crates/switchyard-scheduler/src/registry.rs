//! Agent registry
//!
//! Agent records and their executors live in `RwLock`-protected maps so the
//! dispatcher can read concurrently. Register and unregister are serialized
//! through one advisory mutex so membership changes cannot interleave.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::agent::{AgentExecutor, AgentRecord, AgentStatus};
use crate::error::{Result, SchedulerError};

#[derive(Default)]
pub struct AgentRegistry {
    records: RwLock<HashMap<String, AgentRecord>>,
    executors: RwLock<HashMap<String, Arc<dyn AgentExecutor>>>,
    /// Serializes membership changes only; reads never take it
    membership: Mutex<()>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent with its executor. Returns the agent id.
    pub async fn register(
        &self,
        record: AgentRecord,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<String> {
        let _guard = self.membership.lock().await;
        let id = record.id.clone();
        info!("Registering agent '{}' ({})", record.name, id);
        self.records.write().await.insert(id.clone(), record);
        self.executors.write().await.insert(id.clone(), executor);
        Ok(id)
    }

    pub async fn unregister(&self, agent_id: &str) -> Result<()> {
        let _guard = self.membership.lock().await;
        let removed = self.records.write().await.remove(agent_id);
        self.executors.write().await.remove(agent_id);
        match removed {
            Some(record) => {
                info!("Unregistered agent '{}' ({})", record.name, agent_id);
                Ok(())
            }
            None => Err(SchedulerError::UnknownAgent(agent_id.to_string())),
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.records.read().await.get(agent_id).cloned()
    }

    pub async fn executor(&self, agent_id: &str) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.read().await.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<AgentRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Agents that are available, under capacity, and cover the required
    /// capabilities.
    pub async fn candidates(&self, required: &[String]) -> Vec<AgentRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|a| a.status == AgentStatus::Available && a.has_headroom() && a.covers(required))
            .cloned()
            .collect()
    }

    /// Whether any registered agent covers the capabilities, regardless of
    /// current status or load.
    pub async fn any_covering(&self, required: &[String]) -> bool {
        self.records
            .read()
            .await
            .values()
            .any(|a| a.covers(required))
    }

    /// Increment load, flipping to Busy at capacity. Load never exceeds
    /// `max_concurrent`.
    pub async fn acquire_slot(&self, agent_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let agent = records
            .get_mut(agent_id)
            .ok_or_else(|| SchedulerError::UnknownAgent(agent_id.to_string()))?;
        if !agent.has_headroom() {
            return Err(SchedulerError::AgentUnavailable(agent_id.to_string()));
        }
        agent.current_load += 1;
        agent.last_active = chrono::Utc::now();
        if !agent.has_headroom() {
            agent.status = AgentStatus::Busy;
        }
        debug!(
            "Agent {} load {}/{}",
            agent_id, agent.current_load, agent.max_concurrent
        );
        Ok(())
    }

    /// Decrement load and recompute availability. Saturating at zero.
    pub async fn release_slot(&self, agent_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let agent = records
            .get_mut(agent_id)
            .ok_or_else(|| SchedulerError::UnknownAgent(agent_id.to_string()))?;
        if agent.current_load == 0 {
            warn!("Releasing slot on idle agent {}", agent_id);
        }
        agent.current_load = agent.current_load.saturating_sub(1);
        agent.last_active = chrono::Utc::now();
        if agent.status == AgentStatus::Busy && agent.has_headroom() {
            agent.status = AgentStatus::Available;
        }
        Ok(())
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let mut records = self.records.write().await;
        let agent = records
            .get_mut(agent_id)
            .ok_or_else(|| SchedulerError::UnknownAgent(agent_id.to_string()))?;
        agent.status = status;
        Ok(())
    }

    /// Fold one execution into the agent's metrics.
    pub async fn record_execution(
        &self,
        agent_id: &str,
        elapsed_ms: f64,
        success: bool,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let agent = records
            .get_mut(agent_id)
            .ok_or_else(|| SchedulerError::UnknownAgent(agent_id.to_string()))?;
        agent.metrics.record_execution(elapsed_ms, success);
        agent.last_active = chrono::Utc::now();
        Ok(())
    }

    /// Apply a closure to one record. Used by the health monitor.
    pub async fn update<F>(&self, agent_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut AgentRecord),
    {
        let mut records = self.records.write().await;
        let agent = records
            .get_mut(agent_id)
            .ok_or_else(|| SchedulerError::UnknownAgent(agent_id.to_string()))?;
        f(agent);
        Ok(())
    }
}
