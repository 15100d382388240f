//! Task dispatcher
//!
//! One cooperative dispatch loop pops the highest-priority task, filters
//! candidate agents, applies the selection strategy, and hands the task to a
//! spawned execution. Load accounting and agent metrics are updated on every
//! completion path. A task's timeout runs from submission, so time spent
//! queued counts against it.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentOutcome;
use crate::error::{Result, SchedulerError};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::strategy::{PerformanceBased, SelectionStrategy};
use crate::task::{Task, TaskSpec, TaskStatus};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Wait before re-queueing when no agent qualifies
    pub backoff: Duration,
    /// Applied when a task carries no timeout of its own
    pub default_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(200),
            default_timeout: Duration::from_secs(300),
        }
    }
}

pub struct TaskDispatcher {
    registry: Arc<AgentRegistry>,
    strategy: Arc<dyn SelectionStrategy>,
    config: DispatcherConfig,
    queue: Mutex<TaskQueue>,
    tasks: RwLock<HashMap<String, Task>>,
    cancellations: RwLock<HashMap<String, CancellationToken>>,
    /// Wakes the dispatch loop on submission
    submitted: Notify,
    shutdown: CancellationToken,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self::with_strategy(registry, Arc::new(PerformanceBased))
    }

    pub fn with_strategy(registry: Arc<AgentRegistry>, strategy: Arc<dyn SelectionStrategy>) -> Self {
        Self::with_config(registry, strategy, DispatcherConfig::default())
    }

    pub fn with_config(
        registry: Arc<AgentRegistry>,
        strategy: Arc<dyn SelectionStrategy>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            strategy,
            config,
            queue: Mutex::new(TaskQueue::new()),
            tasks: RwLock::new(HashMap::new()),
            cancellations: RwLock::new(HashMap::new()),
            submitted: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueue a task and return its id immediately.
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<String> {
        let task = Task::from_spec(spec);
        let id = task.id.clone();
        info!(
            "Submitted task '{}' ({}) priority {}",
            task.name, id, task.priority
        );
        self.tasks.write().await.insert(id.clone(), task.clone());
        self.queue.lock().await.push(task);
        self.submitted.notify_one();
        Ok(id)
    }

    pub async fn task(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))
    }

    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Cancel a task. Pending tasks leave the queue without touching agent
    /// load; running tasks are signalled through their cancellation token and
    /// the in-flight executor call is abandoned, not force-killed.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;

        match task.status {
            TaskStatus::Pending => {
                task.advance(TaskStatus::Cancelled)?;
                self.queue.lock().await.remove(task_id);
                info!("Cancelled pending task {}", task_id);
                Ok(())
            }
            TaskStatus::Assigned | TaskStatus::Running => {
                task.advance(TaskStatus::Cancelled)?;
                drop(tasks);
                if let Some(token) = self.cancellations.read().await.get(task_id) {
                    token.cancel();
                }
                info!("Cancelled running task {}", task_id);
                Ok(())
            }
            status => Err(SchedulerError::Execution(format!(
                "Task {} is already {:?}",
                task_id, status
            ))),
        }
    }

    /// Spawn the dispatch loop. Runs until `stop` is called.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run().await })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>) {
        info!("Dispatch loop started ({})", self.strategy.name());
        loop {
            let task = { self.queue.lock().await.pop() };
            let Some(task) = task else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.submitted.notified() => continue,
                }
            };

            if self.shutdown.is_cancelled() {
                break;
            }

            // Skip tasks cancelled while queued
            match self.tasks.read().await.get(&task.id) {
                Some(stored) if stored.status == TaskStatus::Pending => {}
                _ => continue,
            }

            if task.is_overdue(Utc::now()) {
                warn!("Task {} timed out before assignment", task.id);
                // Name the cause when no registered agent covers the
                // capabilities at all
                let error = if self.registry.any_covering(&task.required_capabilities).await {
                    SchedulerError::Timeout(task.id.clone())
                } else {
                    SchedulerError::NoCapableAgent(task.required_capabilities.clone())
                };
                self.finish_task(&task.id, TaskStatus::Failed, None, Some(error.to_string()))
                    .await;
                continue;
            }

            let candidates = self.registry.candidates(&task.required_capabilities).await;
            if candidates.is_empty() {
                debug!(
                    "No capable agent for task {} ({:?}), re-queueing",
                    task.id, task.required_capabilities
                );
                self.queue.lock().await.push(task);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.backoff) => {}
                }
                continue;
            }

            let Some(agent_id) = self.strategy.select(&task, &candidates) else {
                continue;
            };

            if let Err(e) = self.assign(&task.id, &agent_id).await {
                warn!("Failed to assign task {} to {}: {}", task.id, agent_id, e);
                self.queue.lock().await.push(task);
            }
        }
        info!("Dispatch loop stopped");
    }

    /// Acquire a slot, mark the task assigned, and spawn its execution.
    async fn assign(self: &Arc<Self>, task_id: &str, agent_id: &str) -> Result<()> {
        self.registry.acquire_slot(agent_id).await?;

        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;
            task.advance(TaskStatus::Assigned)?;
            task.assigned_agent = Some(agent_id.to_string());
            task.clone()
        };

        let token = CancellationToken::new();
        self.cancellations
            .write()
            .await
            .insert(task_id.to_string(), token.clone());

        let dispatcher = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            dispatcher.execute(task, agent_id, token).await;
        });
        Ok(())
    }

    async fn execute(self: Arc<Self>, task: Task, agent_id: String, token: CancellationToken) {
        let task_id = task.id.clone();
        let started = std::time::Instant::now();

        let run_result = self.run_executor(&task, &agent_id, &token).await;
        let elapsed_ms = started.elapsed().as_millis() as f64;

        match run_result {
            Ok(Some(value)) => {
                self.registry
                    .record_execution(&agent_id, elapsed_ms, true)
                    .await
                    .ok();
                self.finish_task(&task_id, TaskStatus::Completed, Some(value), None)
                    .await;
            }
            Ok(None) => {
                // Cancelled mid-flight; status was already set by cancel_task
                debug!("Task {} execution abandoned after cancel", task_id);
            }
            Err(e) => {
                self.registry
                    .record_execution(&agent_id, elapsed_ms, false)
                    .await
                    .ok();
                self.finish_task(&task_id, TaskStatus::Failed, None, Some(e.to_string()))
                    .await;
            }
        }

        if let Err(e) = self.registry.release_slot(&agent_id).await {
            error!("Failed to release slot on {}: {}", agent_id, e);
        }
        self.cancellations.write().await.remove(&task_id);
    }

    /// Run the executor with retries under the task's deadline.
    ///
    /// `Ok(None)` means the task was cancelled and its status already
    /// reflects that.
    async fn run_executor(
        &self,
        task: &Task,
        agent_id: &str,
        token: &CancellationToken,
    ) -> Result<Option<Value>> {
        let executor = self
            .registry
            .executor(agent_id)
            .await
            .ok_or_else(|| SchedulerError::UnknownAgent(agent_id.to_string()))?;

        {
            let mut tasks = self.tasks.write().await;
            let stored = tasks
                .get_mut(&task.id)
                .ok_or_else(|| SchedulerError::UnknownTask(task.id.clone()))?;
            if stored.status == TaskStatus::Cancelled {
                return Ok(None);
            }
            stored.advance(TaskStatus::Running)?;
        }

        let context = serde_json::json!({ "task_id": task.id, "task_name": task.name });
        let mut attempt = 0u32;
        loop {
            let remaining = self.remaining_time(task)?;
            let handled = tokio::select! {
                _ = token.cancelled() => return Ok(None),
                res = tokio::time::timeout(remaining, executor.handle(task.input.clone(), context.clone())) => res,
            };

            let outcome = match handled {
                Err(_) => return Err(SchedulerError::Timeout(task.id.clone())),
                Ok(Err(e)) => {
                    if attempt < task.max_retries {
                        attempt += 1;
                        warn!(
                            "Task {} attempt {} failed, retrying: {}",
                            task.id, attempt, e
                        );
                        {
                            let mut tasks = self.tasks.write().await;
                            if let Some(stored) = tasks.get_mut(&task.id) {
                                stored.retries = attempt;
                            }
                        }
                        continue;
                    }
                    return Err(SchedulerError::Execution(e.to_string()));
                }
                Ok(Ok(outcome)) => outcome,
            };

            return match outcome {
                AgentOutcome::Complete(value) => Ok(Some(value)),
                AgentOutcome::Stream(rx) => self.drain_stream(task, rx, token).await,
            };
        }
    }

    /// Collect a streamed outcome into an array. Stops on cancellation.
    async fn drain_stream(
        &self,
        task: &Task,
        mut rx: tokio::sync::mpsc::Receiver<Value>,
        token: &CancellationToken,
    ) -> Result<Option<Value>> {
        let mut chunks = Vec::new();
        loop {
            let remaining = self.remaining_time(task)?;
            tokio::select! {
                _ = token.cancelled() => return Ok(None),
                next = tokio::time::timeout(remaining, rx.recv()) => match next {
                    Err(_) => return Err(SchedulerError::Timeout(task.id.clone())),
                    Ok(Some(chunk)) => chunks.push(chunk),
                    Ok(None) => return Ok(Some(Value::Array(chunks))),
                },
            }
        }
    }

    /// Time left until the task's deadline, measured from submission.
    fn remaining_time(&self, task: &Task) -> Result<Duration> {
        match task.deadline() {
            None => Ok(self.config.default_timeout),
            Some(deadline) => {
                let left = deadline - Utc::now();
                left.to_std()
                    .map_err(|_| SchedulerError::Timeout(task.id.clone()))
            }
        }
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };
        if let Err(e) = task.advance(status) {
            debug!("Ignoring late status change for {}: {}", task_id, e);
            return;
        }
        task.result = result;
        task.error = error;
        match status {
            TaskStatus::Completed => info!("Task {} completed", task_id),
            TaskStatus::Failed => warn!(
                "Task {} failed: {}",
                task_id,
                task.error.as_deref().unwrap_or("unknown")
            ),
            _ => {}
        }
    }

    /// Poll until the task reaches a terminal state.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<Task> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let task = self.task(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if std::time::Instant::now() >= deadline {
                return Err(SchedulerError::Timeout(task_id.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentExecutor, AgentRecord, Capability};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct EchoExecutor;

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn handle(&self, input: Value, _context: Value) -> anyhow::Result<AgentOutcome> {
            Ok(AgentOutcome::Complete(json!({ "echo": input })))
        }
    }

    struct SlowExecutor {
        delay: Duration,
    }

    #[async_trait]
    impl AgentExecutor for SlowExecutor {
        async fn handle(&self, input: Value, _context: Value) -> anyhow::Result<AgentOutcome> {
            tokio::time::sleep(self.delay).await;
            Ok(AgentOutcome::Complete(input))
        }
    }

    struct FlakyExecutor {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl AgentExecutor for FlakyExecutor {
        async fn handle(&self, input: Value, _context: Value) -> anyhow::Result<AgentOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient failure {}", n);
            }
            Ok(AgentOutcome::Complete(input))
        }
    }

    struct StreamExecutor;

    #[async_trait]
    impl AgentExecutor for StreamExecutor {
        async fn handle(&self, _input: Value, _context: Value) -> anyhow::Result<AgentOutcome> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for i in 0..3 {
                    if tx.send(json!({ "chunk": i })).await.is_err() {
                        break;
                    }
                }
            });
            Ok(AgentOutcome::Stream(rx))
        }
    }

    async fn setup(
        executor: Arc<dyn AgentExecutor>,
        max_concurrent: usize,
    ) -> (Arc<TaskDispatcher>, String, JoinHandle<()>) {
        let registry = Arc::new(AgentRegistry::new());
        let record = AgentRecord::new(
            "worker",
            "general",
            vec![Capability::new("echo", 0.9, 1.0)],
            max_concurrent,
        );
        let agent_id = registry.register(record, executor).await.unwrap();
        let dispatcher = Arc::new(TaskDispatcher::new(registry));
        let handle = dispatcher.start();
        (dispatcher, agent_id, handle)
    }

    #[tokio::test]
    async fn test_submit_returns_id_immediately() {
        let (dispatcher, _, handle) = setup(Arc::new(EchoExecutor), 1).await;
        let id = dispatcher
            .submit_task(TaskSpec::new("t", json!({"x": 1})))
            .await
            .unwrap();
        assert!(!id.is_empty());
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_task_completes_with_result() {
        let (dispatcher, _, handle) = setup(Arc::new(EchoExecutor), 1).await;
        let id = dispatcher
            .submit_task(TaskSpec::new("t", json!({"x": 1})))
            .await
            .unwrap();
        let task = dispatcher
            .wait_for(&id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap(), json!({"echo": {"x": 1}}));
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_sequential_execution_when_max_concurrent_one() {
        let (dispatcher, agent_id, handle) = setup(
            Arc::new(SlowExecutor {
                delay: Duration::from_millis(50),
            }),
            1,
        )
        .await;

        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                dispatcher
                    .submit_task(TaskSpec::new(format!("t{i}"), json!(i)))
                    .await
                    .unwrap(),
            );
        }

        // While tasks run, load never exceeds 1
        for _ in 0..20 {
            let agent = dispatcher.registry.get(&agent_id).await.unwrap();
            assert!(agent.current_load <= 1);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for id in &ids {
            let task = dispatcher
                .wait_for(id, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
        let agent = dispatcher.registry.get(&agent_id).await.unwrap();
        assert_eq!(agent.current_load, 0);
        assert_eq!(agent.metrics.completed, 3);
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_no_capable_agent_requeues_until_timeout() {
        let (dispatcher, _, handle) = setup(Arc::new(EchoExecutor), 1).await;
        let id = dispatcher
            .submit_task(
                TaskSpec::new("t", json!({}))
                    .with_capabilities(vec!["nonexistent".to_string()])
                    .with_timeout(Duration::from_millis(300)),
            )
            .await
            .unwrap();
        let task = dispatcher
            .wait_for(&id, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error
            .unwrap()
            .contains("No agent can satisfy capabilities"));
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_cancel_pending_leaves_load_untouched() {
        let registry = Arc::new(AgentRegistry::new());
        // No dispatch loop running, so the task stays pending
        let dispatcher = Arc::new(TaskDispatcher::new(registry.clone()));
        let id = dispatcher
            .submit_task(TaskSpec::new("t", json!({})))
            .await
            .unwrap();
        dispatcher.cancel_task(&id).await.unwrap();

        let task = dispatcher.task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(dispatcher.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_running_restores_load() {
        let (dispatcher, agent_id, handle) = setup(
            Arc::new(SlowExecutor {
                delay: Duration::from_secs(30),
            }),
            1,
        )
        .await;
        let id = dispatcher
            .submit_task(TaskSpec::new("t", json!({})))
            .await
            .unwrap();

        // Wait for the task to start running
        for _ in 0..100 {
            if dispatcher.task(&id).await.unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        dispatcher.cancel_task(&id).await.unwrap();

        let task = dispatcher
            .wait_for(&id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        // Slot released once the execution observes the cancel
        for _ in 0..100 {
            if dispatcher.registry.get(&agent_id).await.unwrap().current_load == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            dispatcher.registry.get(&agent_id).await.unwrap().current_load,
            0
        );
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_errors() {
        let (dispatcher, _, handle) = setup(Arc::new(EchoExecutor), 1).await;
        let id = dispatcher
            .submit_task(TaskSpec::new("t", json!({})))
            .await
            .unwrap();
        dispatcher.wait_for(&id, Duration::from_secs(2)).await.unwrap();
        assert!(dispatcher.cancel_task(&id).await.is_err());
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_executor_timeout_fails_task() {
        let (dispatcher, agent_id, handle) = setup(
            Arc::new(SlowExecutor {
                delay: Duration::from_secs(30),
            }),
            1,
        )
        .await;
        let id = dispatcher
            .submit_task(
                TaskSpec::new("t", json!({})).with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        let task = dispatcher
            .wait_for(&id, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        let agent = dispatcher.registry.get(&agent_id).await.unwrap();
        assert_eq!(agent.current_load, 0);
        assert_eq!(agent.metrics.failed, 1);
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_retries_before_failing() {
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let (dispatcher, _, handle) = setup(executor, 1).await;
        let id = dispatcher
            .submit_task(TaskSpec::new("t", json!({"v": 1})).with_max_retries(3))
            .await
            .unwrap();
        let task = dispatcher
            .wait_for(&id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retries, 2);
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails() {
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicUsize::new(0),
            fail_first: 10,
        });
        let (dispatcher, _, handle) = setup(executor, 1).await;
        let id = dispatcher
            .submit_task(TaskSpec::new("t", json!({})).with_max_retries(1))
            .await
            .unwrap();
        let task = dispatcher
            .wait_for(&id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("transient failure"));
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_stream_outcome_collected() {
        let (dispatcher, _, handle) = setup(Arc::new(StreamExecutor), 1).await;
        let id = dispatcher
            .submit_task(TaskSpec::new("t", json!({})))
            .await
            .unwrap();
        let task = dispatcher
            .wait_for(&id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let chunks = task.result.unwrap();
        assert_eq!(
            chunks,
            json!([{ "chunk": 0 }, { "chunk": 1 }, { "chunk": 2 }])
        );
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_priority_order_respected() {
        // Dispatch loop not started yet, so both tasks queue up first
        let registry = Arc::new(AgentRegistry::new());
        let record = AgentRecord::new("worker", "general", vec![], 1);
        registry.register(record, Arc::new(EchoExecutor)).await.unwrap();
        let dispatcher = Arc::new(TaskDispatcher::new(registry));

        let low = dispatcher
            .submit_task(TaskSpec::new("low", json!({})).with_priority(1))
            .await
            .unwrap();
        let high = dispatcher
            .submit_task(TaskSpec::new("high", json!({})).with_priority(9))
            .await
            .unwrap();

        let handle = dispatcher.start();
        let high_task = dispatcher
            .wait_for(&high, Duration::from_secs(2))
            .await
            .unwrap();
        let low_task = dispatcher
            .wait_for(&low, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(high_task.finished_at.unwrap() <= low_task.finished_at.unwrap());
        dispatcher.stop();
        handle.abort();
    }

    #[tokio::test]
    async fn test_unknown_task_errors() {
        let registry = Arc::new(AgentRegistry::new());
        let dispatcher = TaskDispatcher::new(registry);
        assert!(matches!(
            dispatcher.task("nope").await,
            Err(SchedulerError::UnknownTask(_))
        ));
        assert!(matches!(
            dispatcher.cancel_task("nope").await,
            Err(SchedulerError::UnknownTask(_))
        ));
    }
}
