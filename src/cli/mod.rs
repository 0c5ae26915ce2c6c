//! Command-line interface for stagegate.
//!
//! Runs pipelines, reports workflow status from the event log, and serves
//! the JSON protocol over stdin/stdout.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use crate::config::{Config, Settings};
use crate::domain::{ExecutionStatus, WorkflowExecution};
use crate::engine::Engine;

/// stagegate - stage pipeline orchestrator with approval gates
#[derive(Parser, Debug)]
#[command(name = "stagegate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve protocol requests: one JSON envelope per stdin line
    Dispatch,

    /// Check a pipeline definition and print its stage layers
    Validate {
        /// Pipeline file or name (looked up as pipelines/<name>.yaml)
        pipeline: String,
    },

    /// Run a pipeline
    Run {
        /// Pipeline file or name
        pipeline: String,

        /// Workflow input as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Resume this workflow instead of starting a new one
        #[arg(long)]
        resume: Option<String>,
    },

    /// Show the status of a workflow
    Status {
        /// Workflow ID
        workflow_id: String,
    },

    /// List workflows with an event log
    Workflows {
        /// Maximum number of workflows to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Expire overdue and escalate stalled confirm requests
    Sweep,

    /// Show the resolved configuration
    Config,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = Settings::load()?;
        match self.command {
            Commands::Dispatch => dispatch(&config).await,
            Commands::Validate { pipeline } => validate(&config, &pipeline),
            Commands::Run {
                pipeline,
                input,
                resume,
            } => run_pipeline(&config, &pipeline, input.as_deref(), resume.as_deref()).await,
            Commands::Status { workflow_id } => show_status(&config, &workflow_id).await,
            Commands::Workflows { limit } => list_workflows(&config, limit).await,
            Commands::Sweep => sweep(&config).await,
            Commands::Config => show_config(&config),
        }
    }
}

/// Read request envelopes from stdin and write one response line each
async fn dispatch(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let dispatcher = engine.dispatcher();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut handled = 0usize;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatcher.dispatch_json(&line).await;
        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        stdout.write_all(json.as_bytes()).await?;
        stdout.flush().await?;
        handled += 1;
    }

    info!(handled, "Dispatch finished");
    Ok(())
}

fn validate(config: &Config, pipeline_name: &str) -> Result<()> {
    let pipeline = config.load_pipeline(pipeline_name)?;
    pipeline.validate()?;
    let layers = pipeline.plan()?;

    println!("Pipeline: {}", pipeline.name);
    println!(
        "Mode: {}",
        if pipeline.options.parallel_execution { "parallel" } else { "sequential" }
    );
    for (i, layer) in layers.iter().enumerate() {
        println!("  {}: {}", i + 1, layer.join(", "));
    }
    Ok(())
}

async fn run_pipeline(
    config: &Config,
    pipeline_name: &str,
    input: Option<&str>,
    resume: Option<&str>,
) -> Result<()> {
    let pipeline = config.load_pipeline(pipeline_name)?;
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("Input is not valid JSON")?,
        None => Value::Null,
    };

    let engine = Engine::open(config).await?;
    let execution = match resume {
        Some(workflow_id) => engine.resume(workflow_id, &pipeline, input).await?,
        None => engine.run(&pipeline, input).await?,
    };

    match execution.status {
        ExecutionStatus::Completed => {
            if let Some(output) = execution
                .stages
                .iter()
                .rev()
                .find_map(|stage| stage.output.as_ref())
            {
                println!("{}", serde_json::to_string_pretty(output)?);
            }
            eprintln!("\n[Workflow {} completed]", execution.id);
        }
        status => {
            print_stages(&execution);
            let report = execution.report();
            eprintln!(
                "\n[Workflow {} {:?}: failed {:?}, compensated {}]",
                execution.id, status, report.failed, report.compensation_ran
            );
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn show_status(config: &Config, workflow_id: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let log = engine
        .event_log()
        .context("Event log is disabled (events.jsonl: false)")?;
    let execution = log.load_execution(workflow_id).await?;

    println!("Workflow ID: {}", execution.id);
    println!("Status: {:?}", execution.status);
    println!("Started: {}", execution.started_at);
    if let Some(completed) = execution.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(current) = &execution.current_stage {
        println!("Current stage: {}", current);
    }
    print_stages(&execution);
    Ok(())
}

fn print_stages(execution: &WorkflowExecution) {
    println!("\nStages:");
    for stage in &execution.stages {
        match &stage.error {
            Some(err) => println!(
                "  {}: {:?} (attempts {}, {}: {})",
                stage.stage, stage.status, stage.attempts, err.code, err.message
            ),
            None => println!("  {}: {:?} (attempts {})", stage.stage, stage.status, stage.attempts),
        }
    }
}

async fn list_workflows(config: &Config, limit: usize) -> Result<()> {
    let engine = Engine::open(config).await?;
    let log = engine
        .event_log()
        .context("Event log is disabled (events.jsonl: false)")?;

    let mut executions = Vec::new();
    for subject in log.list_subjects().await? {
        // Entity subjects (confirm requests, tasks) share the directory
        if let Ok(execution) = log.load_execution(&subject).await {
            executions.push(execution);
        }
    }
    if executions.is_empty() {
        println!("No workflows found");
        return Ok(());
    }
    executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!("{:<38} {:<12} {:<25}", "WORKFLOW ID", "STATUS", "STARTED");
    println!("{}", "-".repeat(75));
    for execution in executions.into_iter().take(limit) {
        println!(
            "{:<38} {:<12} {:<25}",
            execution.id,
            format!("{:?}", execution.status),
            execution.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn sweep(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let (expired, escalated) = engine.sweep(Utc::now()).await?;
    println!("Expired: {}", expired);
    println!("Escalated: {}", escalated);
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", config.home.display());
    println!("  Events:    {}", config.events_dir().display());
    println!("  Audit log: {}", config.audit_log_path().display());
    println!("  Pipelines: {}", config.home.join("pipelines").display());
    println!();
    println!("Settings:");
    print!("{}", serde_yaml::to_string(&config.settings)?);
    Ok(())
}
