//! DAG workflow engine
//!
//! Steps execute as tasks through the dispatcher. A shared JSON context
//! carries values between steps via input and output mappings. Gates are
//! safe predicates only: a tiny comparison grammar or a named predicate from
//! a registered table, never evaluated expressions. A failed step fails the
//! workflow immediately; completed steps are not rolled back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::TaskDispatcher;
use crate::error::{Result, SchedulerError};
use crate::task::{Task, TaskSpec, TaskStatus};

/// A predicate applied to the whole workflow context
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Named predicates a workflow may reference by gate name
#[derive(Default, Clone)]
pub struct PredicateTable {
    predicates: HashMap<String, Predicate>,
}

impl PredicateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, predicate: Predicate) {
        self.predicates.insert(name.into(), predicate);
    }

    fn get(&self, name: &str) -> Option<&Predicate> {
        self.predicates.get(name)
    }
}

/// Condition deciding whether a step runs or is skipped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepGate {
    Exists { field: String },
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    Named { name: String },
}

impl StepGate {
    /// Parse the comparison grammar: `<field> exists`, `<field> == <literal>`
    /// or `<field> != <literal>`. Literals parse as JSON first, then as bare
    /// strings.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if let Some(field) = expr.strip_suffix(" exists") {
            let field = field.trim();
            if field.is_empty() {
                return Err(SchedulerError::InvalidWorkflow(format!(
                    "Empty field in gate '{expr}'"
                )));
            }
            return Ok(Self::Exists {
                field: field.to_string(),
            });
        }
        for (op, not) in [("==", false), ("!=", true)] {
            if let Some((field, literal)) = expr.split_once(op) {
                let field = field.trim();
                let literal = literal.trim();
                if field.is_empty() || literal.is_empty() {
                    return Err(SchedulerError::InvalidWorkflow(format!(
                        "Malformed gate '{expr}'"
                    )));
                }
                let value = serde_json::from_str(literal)
                    .unwrap_or_else(|_| Value::String(literal.to_string()));
                return Ok(if not {
                    Self::NotEquals {
                        field: field.to_string(),
                        value,
                    }
                } else {
                    Self::Equals {
                        field: field.to_string(),
                        value,
                    }
                });
            }
        }
        Err(SchedulerError::InvalidWorkflow(format!(
            "Unrecognized gate '{expr}'"
        )))
    }

    fn evaluate(&self, context: &Map<String, Value>, predicates: &PredicateTable) -> Result<bool> {
        match self {
            Self::Exists { field } => Ok(context.contains_key(field)),
            Self::Equals { field, value } => Ok(context.get(field) == Some(value)),
            Self::NotEquals { field, value } => Ok(context.get(field) != Some(value)),
            Self::Named { name } => {
                let predicate = predicates.get(name).ok_or_else(|| {
                    SchedulerError::InvalidWorkflow(format!("Unknown predicate '{name}'"))
                })?;
                Ok(predicate(&Value::Object(context.clone())))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    /// Capability the executing agent must cover
    pub capability: String,
    /// Task input field -> context key
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    /// Result field -> context key ("." maps the whole result)
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
    #[serde(default)]
    pub gate: Option<StepGate>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capability: capability.into(),
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            gate: None,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_gate(mut self, gate: StepGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_input_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.input_mapping = mapping;
        self
    }

    pub fn with_output_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.output_mapping = mapping;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    /// Shared key-value context merged into by step outputs
    pub context: Map<String, Value>,
    pub status: WorkflowStatus,
    pub failed_step: Option<String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            steps,
            context: Map::new(),
            status: WorkflowStatus::Running,
            failed_step: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Reject unknown dependency references and cycles up front.
    fn validate(&self) -> Result<()> {
        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != self.steps.len() {
            return Err(SchedulerError::InvalidWorkflow(
                "Duplicate step ids".to_string(),
            ));
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(SchedulerError::InvalidWorkflow(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        // Kahn's algorithm over the dependency edges
        let mut indegree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop() {
            visited += 1;
            for step in &self.steps {
                if step.depends_on.iter().any(|d| d == id) {
                    let d = indegree
                        .get_mut(step.id.as_str())
                        .ok_or_else(|| SchedulerError::InvalidWorkflow("corrupt graph".into()))?;
                    *d -= 1;
                    if *d == 0 {
                        ready.push(step.id.as_str());
                    }
                }
            }
        }
        if visited != self.steps.len() {
            return Err(SchedulerError::InvalidWorkflow(
                "Dependency cycle detected".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs workflows on top of the dispatcher
pub struct WorkflowEngine {
    dispatcher: Arc<TaskDispatcher>,
    predicates: PredicateTable,
    step_timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self {
            dispatcher,
            predicates: PredicateTable::new(),
            step_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_predicates(mut self, predicates: PredicateTable) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Execute the workflow to a terminal status. Any step failure fails the
    /// whole workflow immediately; steps not yet scheduled never run.
    pub async fn run(&self, mut workflow: Workflow) -> Result<Workflow> {
        workflow.validate()?;
        info!(
            "Running workflow '{}' ({} steps)",
            workflow.name,
            workflow.steps.len()
        );

        let mut satisfied: HashSet<String> = HashSet::new();
        // task id -> index into workflow.steps
        let mut in_flight: HashMap<String, usize> = HashMap::new();
        loop {
            self.submit_ready(&mut workflow, &mut satisfied, &mut in_flight)
                .await?;

            if in_flight.is_empty() {
                let all_done = workflow
                    .steps
                    .iter()
                    .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped));
                if all_done {
                    workflow.status = WorkflowStatus::Completed;
                    info!("Workflow '{}' completed", workflow.name);
                } else {
                    // Validation rules this out, but a derived status must
                    // still terminate
                    workflow.status = WorkflowStatus::Failed;
                }
                return Ok(workflow);
            }

            // Each completion is merged as it lands so steps whose
            // dependencies are now satisfied start without waiting for
            // unrelated in-flight steps.
            let task = self.next_terminal(&in_flight).await?;
            let Some(index) = in_flight.remove(&task.id) else {
                continue;
            };
            let step_id = workflow.steps[index].id.clone();
            if task.status != TaskStatus::Completed {
                warn!(
                    "Step '{}' failed, aborting workflow '{}'",
                    step_id, workflow.name
                );
                for sibling in in_flight.keys() {
                    if let Err(e) = self.dispatcher.cancel_task(sibling).await {
                        debug!("Could not cancel sibling task {}: {}", sibling, e);
                    }
                }
                workflow.steps[index].status = StepStatus::Failed;
                workflow.status = WorkflowStatus::Failed;
                workflow.failed_step = Some(step_id);
                return Ok(workflow);
            }

            merge_step_output(
                &workflow.steps[index].output_mapping,
                task.result.as_ref(),
                &mut workflow.context,
            );
            workflow.steps[index].status = StepStatus::Completed;
            satisfied.insert(step_id);
        }
    }

    /// Submit every pending step whose dependencies are satisfied. A gated-off
    /// step counts as satisfied immediately, which can unlock further steps,
    /// so this loops until the ready set is exhausted.
    async fn submit_ready(
        &self,
        workflow: &mut Workflow,
        satisfied: &mut HashSet<String>,
        in_flight: &mut HashMap<String, usize>,
    ) -> Result<()> {
        loop {
            let ready: Vec<usize> = workflow
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.status == StepStatus::Pending
                        && s.depends_on.iter().all(|d| satisfied.contains(d))
                })
                .map(|(i, _)| i)
                .collect();
            if ready.is_empty() {
                return Ok(());
            }

            for index in ready {
                let step = &workflow.steps[index];
                if let Some(gate) = &step.gate {
                    if !gate.evaluate(&workflow.context, &self.predicates)? {
                        debug!("Step '{}' gated off, skipping", step.id);
                        workflow.steps[index].status = StepStatus::Skipped;
                        satisfied.insert(workflow.steps[index].id.clone());
                        continue;
                    }
                }

                let input = build_step_input(&workflow.steps[index], &workflow.context);
                let spec = TaskSpec::new(workflow.steps[index].name.clone(), input)
                    .with_capabilities(vec![workflow.steps[index].capability.clone()])
                    .with_timeout(self.step_timeout);
                let task_id = self.dispatcher.submit_task(spec).await?;
                workflow.steps[index].status = StepStatus::Running;
                in_flight.insert(task_id, index);
            }
        }
    }

    /// Poll the in-flight tasks until one reaches a terminal state. Each
    /// task carries its own dispatcher-side timeout, so this always returns.
    async fn next_terminal(&self, in_flight: &HashMap<String, usize>) -> Result<Task> {
        loop {
            for task_id in in_flight.keys() {
                let task = self.dispatcher.task(task_id).await?;
                if task.status.is_terminal() {
                    return Ok(task);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Build a step's task input from the shared context per its input mapping.
fn build_step_input(step: &WorkflowStep, context: &Map<String, Value>) -> Value {
    let mut input = Map::new();
    for (input_field, context_key) in &step.input_mapping {
        if let Some(value) = context.get(context_key) {
            input.insert(input_field.clone(), value.clone());
        }
    }
    Value::Object(input)
}

/// Merge a completed step's result into the context per its output mapping.
/// The key "." maps the whole result value.
fn merge_step_output(
    mapping: &HashMap<String, String>,
    result: Option<&Value>,
    context: &mut Map<String, Value>,
) {
    let Some(result) = result else {
        return;
    };
    for (result_field, context_key) in mapping {
        let value = if result_field == "." {
            Some(result.clone())
        } else {
            result.get(result_field).cloned()
        };
        if let Some(value) = value {
            context.insert(context_key.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentExecutor, AgentOutcome, AgentRecord, Capability};
    use crate::registry::AgentRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingExecutor {
        order: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl AgentExecutor for RecordingExecutor {
        async fn handle(&self, input: Value, context: Value) -> anyhow::Result<AgentOutcome> {
            let name = context
                .get("task_name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            self.order.lock().unwrap().push(name.clone());
            if self.fail_on.as_deref() == Some(name.as_str()) {
                anyhow::bail!("step '{}' exploded", name);
            }
            Ok(AgentOutcome::Complete(json!({ "step": name, "saw": input })))
        }
    }

    struct TimingExecutor {
        events: Arc<Mutex<Vec<String>>>,
        delays: HashMap<String, Duration>,
    }

    #[async_trait]
    impl AgentExecutor for TimingExecutor {
        async fn handle(&self, _input: Value, context: Value) -> anyhow::Result<AgentOutcome> {
            let name = context
                .get("task_name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            self.events.lock().unwrap().push(format!("start:{name}"));
            if let Some(delay) = self.delays.get(&name) {
                tokio::time::sleep(*delay).await;
            }
            self.events.lock().unwrap().push(format!("end:{name}"));
            Ok(AgentOutcome::Complete(json!({ "step": name })))
        }
    }

    async fn engine(
        fail_on: Option<&str>,
    ) -> (WorkflowEngine, Arc<TaskDispatcher>, Arc<Mutex<Vec<String>>>) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(AgentRegistry::new());
        let record = AgentRecord::new(
            "worker",
            "general",
            vec![Capability::new("work", 0.9, 1.0)],
            4,
        );
        registry
            .register(
                record,
                Arc::new(RecordingExecutor {
                    order: order.clone(),
                    fail_on: fail_on.map(String::from),
                }),
            )
            .await
            .unwrap();
        let dispatcher = Arc::new(TaskDispatcher::new(registry));
        dispatcher.start();
        (
            WorkflowEngine::new(dispatcher.clone()).with_step_timeout(Duration::from_secs(5)),
            dispatcher,
            order,
        )
    }

    fn linear_steps() -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::new("a", "step-a", "work"),
            WorkflowStep::new("b", "step-b", "work").with_depends_on(vec!["a".to_string()]),
            WorkflowStep::new("c", "step-c", "work").with_depends_on(vec!["b".to_string()]),
        ]
    }

    #[tokio::test]
    async fn test_linear_workflow_runs_in_order() {
        let (engine, dispatcher, order) = engine(None).await;
        let done = engine.run(Workflow::new("linear", linear_steps())).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(*order.lock().unwrap(), vec!["step-a", "step-b", "step-c"]);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_failed_step_aborts_without_scheduling_dependents() {
        let (engine, dispatcher, order) = engine(Some("step-b")).await;
        let done = engine.run(Workflow::new("linear", linear_steps())).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.failed_step.as_deref(), Some("b"));
        assert_eq!(*order.lock().unwrap(), vec!["step-a", "step-b"]);
        assert_eq!(done.steps[2].status, StepStatus::Pending);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_dependent_starts_before_unrelated_sibling_finishes() {
        // Two roots: fast-a finishes quickly, slow-b keeps running. dep-c
        // depends only on fast-a and must not wait for slow-b.
        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(AgentRegistry::new());
        let record = AgentRecord::new(
            "worker",
            "general",
            vec![Capability::new("work", 0.9, 1.0)],
            4,
        );
        registry
            .register(
                record,
                Arc::new(TimingExecutor {
                    events: events.clone(),
                    delays: [
                        ("fast-a".to_string(), Duration::from_millis(20)),
                        ("slow-b".to_string(), Duration::from_millis(400)),
                    ]
                    .into(),
                }),
            )
            .await
            .unwrap();
        let dispatcher = Arc::new(TaskDispatcher::new(registry));
        dispatcher.start();
        let engine =
            WorkflowEngine::new(dispatcher.clone()).with_step_timeout(Duration::from_secs(5));

        let steps = vec![
            WorkflowStep::new("a", "fast-a", "work"),
            WorkflowStep::new("b", "slow-b", "work"),
            WorkflowStep::new("c", "dep-c", "work").with_depends_on(vec!["a".to_string()]),
        ];
        let done = engine.run(Workflow::new("diamond", steps)).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);

        let events = events.lock().unwrap();
        let position = |e: &str| {
            events
                .iter()
                .position(|v| v == e)
                .unwrap_or_else(|| panic!("missing event {e} in {events:?}"))
        };
        assert!(position("start:dep-c") < position("end:slow-b"));
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_output_flows_into_dependent_input() {
        let (engine, dispatcher, _) = engine(None).await;
        let steps = vec![
            WorkflowStep::new("a", "step-a", "work").with_output_mapping(
                [("step".to_string(), "produced_by".to_string())].into(),
            ),
            WorkflowStep::new("b", "step-b", "work")
                .with_depends_on(vec!["a".to_string()])
                .with_input_mapping([("upstream".to_string(), "produced_by".to_string())].into()),
        ];
        let done = engine.run(Workflow::new("mapped", steps)).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.context.get("produced_by"), Some(&json!("step-a")));
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_gated_step_skipped_but_satisfies_dependents() {
        let (engine, dispatcher, order) = engine(None).await;
        let steps = vec![
            WorkflowStep::new("a", "step-a", "work"),
            WorkflowStep::new("b", "step-b", "work")
                .with_depends_on(vec!["a".to_string()])
                .with_gate(StepGate::parse("missing_key exists").unwrap()),
            WorkflowStep::new("c", "step-c", "work").with_depends_on(vec!["b".to_string()]),
        ];
        let done = engine.run(Workflow::new("gated", steps)).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.steps[1].status, StepStatus::Skipped);
        assert_eq!(*order.lock().unwrap(), vec!["step-a", "step-c"]);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_named_predicate_gate() {
        let (engine, dispatcher, _) = engine(None).await;
        let mut table = PredicateTable::new();
        table.register(
            "always_no",
            Arc::new(|_ctx: &Value| false) as Predicate,
        );
        let engine = engine.with_predicates(table);
        let steps = vec![WorkflowStep::new("a", "step-a", "work")
            .with_gate(StepGate::Named {
                name: "always_no".to_string(),
            })];
        let done = engine.run(Workflow::new("named", steps)).await.unwrap();
        assert_eq!(done.steps[0].status, StepStatus::Skipped);
        assert_eq!(done.status, WorkflowStatus::Completed);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_unknown_predicate_is_invalid() {
        let (engine, dispatcher, _) = engine(None).await;
        let steps = vec![WorkflowStep::new("a", "step-a", "work")
            .with_gate(StepGate::Named {
                name: "nope".to_string(),
            })];
        let err = engine.run(Workflow::new("bad", steps)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidWorkflow(_)));
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let (engine, dispatcher, _) = engine(None).await;
        let steps = vec![
            WorkflowStep::new("a", "step-a", "work").with_depends_on(vec!["b".to_string()]),
            WorkflowStep::new("b", "step-b", "work").with_depends_on(vec!["a".to_string()]),
        ];
        let err = engine.run(Workflow::new("cycle", steps)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidWorkflow(_)));
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let (engine, dispatcher, _) = engine(None).await;
        let steps =
            vec![WorkflowStep::new("a", "step-a", "work").with_depends_on(vec!["ghost".to_string()])];
        let err = engine.run(Workflow::new("bad", steps)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidWorkflow(_)));
        dispatcher.stop();
    }

    #[test]
    fn test_gate_grammar() {
        assert!(matches!(
            StepGate::parse("result exists").unwrap(),
            StepGate::Exists { .. }
        ));
        match StepGate::parse("count == 3").unwrap() {
            StepGate::Equals { field, value } => {
                assert_eq!(field, "count");
                assert_eq!(value, json!(3));
            }
            other => panic!("unexpected gate {other:?}"),
        }
        match StepGate::parse("mode != fast").unwrap() {
            StepGate::NotEquals { field, value } => {
                assert_eq!(field, "mode");
                assert_eq!(value, json!("fast"));
            }
            other => panic!("unexpected gate {other:?}"),
        }
        assert!(StepGate::parse("rm -rf /").is_err());
        assert!(StepGate::parse(" exists").is_err());
    }

    #[test]
    fn test_gate_evaluation() {
        let table = PredicateTable::new();
        let mut context = Map::new();
        context.insert("count".to_string(), json!(3));

        assert!(StepGate::parse("count exists")
            .unwrap()
            .evaluate(&context, &table)
            .unwrap());
        assert!(StepGate::parse("count == 3")
            .unwrap()
            .evaluate(&context, &table)
            .unwrap());
        assert!(!StepGate::parse("count != 3")
            .unwrap()
            .evaluate(&context, &table)
            .unwrap());
        assert!(!StepGate::parse("missing exists")
            .unwrap()
            .evaluate(&context, &table)
            .unwrap());
    }
}
