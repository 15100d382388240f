use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use switchyard_core::{
    CompletionClient, LearnerConfig, RouteRequest, Router, RuleSet, StaticCompletion,
};
use switchyard_scheduler::{
    AgentExecutor, AgentOutcome, AgentRecord, AgentRegistry, Capability, DispatcherConfig,
    PerformanceBased, TaskDispatcher, TaskSpec, Workflow, WorkflowEngine, WorkflowStep,
};

mod config;

use config::SwitchyardConfig;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(version)]
#[command(about = "Switchyard — request routing and agent task scheduling")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a prompt offline and print the decision
    Route {
        /// The prompt to route
        prompt: String,

        /// Session identifier
        #[arg(long, default_value = "cli-session")]
        session: String,

        /// User identifier
        #[arg(long, default_value = "cli-user")]
        user: String,
    },

    /// List the loaded routing rules
    Rules,

    /// Register sample agents, run tasks and a workflow, print outcomes
    Demo,

    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = SwitchyardConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Route {
            prompt,
            session,
            user,
        } => cmd_route(&config, &prompt, &session, &user).await,
        Commands::Rules => cmd_rules(&config),
        Commands::Demo => cmd_demo(&config).await,
        Commands::Config => cmd_config(&config),
    }
}

fn load_rules(config: &SwitchyardConfig) -> Result<RuleSet> {
    match &config.routing.rules_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read rules file: {}", path.display()))?;
            RuleSet::from_toml(&contents)
        }
        None => Ok(RuleSet::builtin()),
    }
}

fn build_router(config: &SwitchyardConfig, rules: RuleSet) -> Router {
    // Offline backend: classifier stages defer, pattern and fallback decide
    let completion: Arc<dyn CompletionClient> = Arc::new(StaticCompletion::new());
    Router::builder(completion)
        .with_rules(rules)
        .with_default_agent(config.routing.default_agent.clone())
        .with_cache(config.cache.capacity, config.cache.ttls())
        .with_classifier_threshold(config.routing.classifier_threshold)
        .with_learner_config(LearnerConfig::default())
        .build()
}

async fn cmd_route(
    config: &SwitchyardConfig,
    prompt: &str,
    session: &str,
    user: &str,
) -> Result<()> {
    let router = build_router(config, load_rules(config)?);
    let result = router
        .route(&RouteRequest::new(prompt, session, user))
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_rules(config: &SwitchyardConfig) -> Result<()> {
    let rules = load_rules(config)?;
    println!("{} routing rules loaded:", rules.len());
    for rule in rules.iter() {
        println!(
            "  [{:>3}] {:<10} {:<20} /{}/",
            rule.priority,
            rule.agent_type,
            rule.intent,
            rule.pattern.as_str()
        );
    }
    Ok(())
}

fn cmd_config(config: &SwitchyardConfig) -> Result<()> {
    println!("Config dir: {}", config::config_dir().display());
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Demo executor: uppercases or reverses text depending on its capability.
struct TextExecutor {
    mode: &'static str,
}

#[async_trait]
impl AgentExecutor for TextExecutor {
    async fn handle(&self, input: Value, _context: Value) -> anyhow::Result<AgentOutcome> {
        let text = input
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let output = match self.mode {
            "uppercase" => text.to_uppercase(),
            "reverse" => text.chars().rev().collect(),
            _ => text,
        };
        Ok(AgentOutcome::Complete(json!({ "text": output })))
    }
}

async fn cmd_demo(config: &SwitchyardConfig) -> Result<()> {
    let registry = Arc::new(AgentRegistry::new());

    registry
        .register(
            AgentRecord::new(
                "upper-worker",
                "text",
                vec![Capability::new("uppercase", 0.9, 1.0)],
                2,
            ),
            Arc::new(TextExecutor { mode: "uppercase" }),
        )
        .await?;
    registry
        .register(
            AgentRecord::new(
                "reverse-worker",
                "text",
                vec![Capability::new("reverse", 0.9, 1.0)],
                2,
            ),
            Arc::new(TextExecutor { mode: "reverse" }),
        )
        .await?;

    let dispatcher = Arc::new(TaskDispatcher::with_config(
        registry,
        Arc::new(PerformanceBased),
        DispatcherConfig {
            backoff: Duration::from_millis(config.dispatch.backoff_ms),
            default_timeout: Duration::from_secs(config.dispatch.default_timeout_secs),
        },
    ));
    let loop_handle = dispatcher.start();

    println!("== Tasks ==");
    let mut ids = Vec::new();
    for (capability, text) in [("uppercase", "hello switchyard"), ("reverse", "dispatch me")] {
        let id = dispatcher
            .submit_task(
                TaskSpec::new(format!("demo-{capability}"), json!({ "text": text }))
                    .with_capabilities(vec![capability.to_string()])
                    .with_priority(1),
            )
            .await?;
        ids.push(id);
    }
    for id in &ids {
        let task = dispatcher.wait_for(id, Duration::from_secs(10)).await?;
        println!(
            "  {} -> {:?} {}",
            task.name,
            task.status,
            task.result.map(|r| r.to_string()).unwrap_or_default()
        );
    }

    println!("== Workflow ==");
    let steps = vec![
        WorkflowStep::new("shout", "demo-shout", "uppercase")
            .with_input_mapping([("text".to_string(), "text".to_string())].into())
            .with_output_mapping([("text".to_string(), "text".to_string())].into()),
        WorkflowStep::new("flip", "demo-flip", "reverse")
            .with_depends_on(vec!["shout".to_string()])
            .with_input_mapping([("text".to_string(), "text".to_string())].into())
            .with_output_mapping([("text".to_string(), "text".to_string())].into()),
    ];
    let mut context = serde_json::Map::new();
    context.insert("text".to_string(), json!("workflow input"));
    let engine = WorkflowEngine::new(dispatcher.clone()).with_step_timeout(Duration::from_secs(10));
    let done = engine
        .run(Workflow::new("demo", steps).with_context(context))
        .await?;
    println!("  status: {:?}", done.status);
    println!("  context.text: {}", done.context.get("text").cloned().unwrap_or(Value::Null));

    dispatcher.stop();
    loop_handle.abort();
    Ok(())
}
