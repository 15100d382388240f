//! Agent health monitor
//!
//! A periodic sweep decays the health of idle agents and marks unhealthy
//! ones as errored. Runs until its cancellation token fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentStatus;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Sweep interval
    pub interval: Duration,
    /// Agents idle longer than this decay
    pub idle_after: Duration,
    /// Multiplier applied to health per sweep while idle
    pub decay: f64,
    /// Below this, the agent is marked errored
    pub error_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_after: Duration::from_secs(300),
            decay: 0.9,
            error_threshold: 0.5,
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    config: HealthConfig,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self::with_config(registry, HealthConfig::default())
    }

    pub fn with_config(registry: Arc<AgentRegistry>, config: HealthConfig) -> Self {
        Self {
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                "Health monitor started (interval {:?})",
                self.config.interval
            );
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("Health monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }

    /// One decay pass over all agents.
    pub async fn sweep(&self) {
        let idle_cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.idle_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        for agent in self.registry.list().await {
            if agent.last_active >= idle_cutoff {
                continue;
            }
            let decay = self.config.decay;
            let threshold = self.config.error_threshold;
            let id = agent.id.clone();
            let result = self
                .registry
                .update(&id, |record| {
                    record.health *= decay;
                    debug!("Agent {} idle, health decayed to {:.2}", record.id, record.health);
                    if record.health < threshold && record.status != AgentStatus::Error {
                        warn!("Agent {} marked errored (health {:.2})", record.id, record.health);
                        record.status = AgentStatus::Error;
                    }
                })
                .await;
            if let Err(e) = result {
                debug!("Health sweep skipped {}: {}", id, e);
            }
        }
    }
}
