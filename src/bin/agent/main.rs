mod face;

use std::net::SocketAddr;
use std::sync::Arc;

use agentic_rpa::{
    AgentConfig, ChromeDriver, ExecutionEvent, OpenAiPlanner, Orchestrator, TaskId, TaskStore,
};
use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent", version, about = "Plan, run and repair browser tasks from a prompt")]
struct Cli {
    /// Show the Chrome window instead of running headless
    #[arg(long, global = true)]
    headed: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task to completion and print the result
    Run { prompt: String },

    /// Run a task and print each execution event as a JSON line
    Stream { prompt: String },

    /// Serve the task API over HTTP
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::from_env()?;
    if cli.headed {
        config.headless = false;
    }

    let planner = OpenAiPlanner::new(&config.planner, config.planner_timeout)?;
    let store = Arc::new(TaskStore::open(&config.task_store)?);
    info!(store = %store.path().display(), "task store ready");

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(planner),
        Arc::new(ChromeDriver),
        config,
    ));

    match cli.command {
        Command::Run { prompt } => run(&orchestrator, &store, &prompt).await,
        Command::Stream { prompt } => stream(&orchestrator, &store, &prompt).await,
        Command::Serve { addr } => face::serve(addr, orchestrator, store).await,
    }
}

async fn run(orchestrator: &Orchestrator, store: &TaskStore, prompt: &str) -> Result<()> {
    let record = store.create(prompt)?;
    info!(task_id = record.id, "task started");

    let result = match orchestrator.run(prompt).await {
        Ok(result) => result,
        Err(e) => {
            store.fail(record.id, &e.to_string(), None)?;
            return Err(e.into());
        }
    };

    match &result.error {
        Some(error) => store.fail(record.id, error, Some(result.clone()))?,
        None => store.complete(record.id, result.clone())?,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Some(error) = result.error {
        bail!("task {} failed: {error}", record.id);
    }
    Ok(())
}

async fn stream(orchestrator: &Arc<Orchestrator>, store: &TaskStore, prompt: &str) -> Result<()> {
    let record = store.create(prompt)?;
    info!(task_id = record.id, "task started; press Ctrl-C to stop");

    let mut events = orchestrator.run_stream(prompt, record.id);
    let mut stop_sent = false;
    let mut failure = None;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                record_event(store, record.id, &event)?;
                match event {
                    ExecutionEvent::Error { error, .. } => failure = Some(error),
                    ExecutionEvent::Stopped { reason } => failure = Some(format!("stopped: {reason}")),
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c(), if !stop_sent => {
                stop_sent = true;
                warn!(task_id = record.id, "interrupt received; stopping after the current step");
                orchestrator.request_stop(record.id);
            }
        }
    }

    if let Some(error) = failure {
        bail!("task {} failed: {error}", record.id);
    }
    Ok(())
}

/// Settle the task record on a terminal event.
pub(crate) fn record_event(store: &TaskStore, id: TaskId, event: &ExecutionEvent) -> Result<()> {
    match event {
        ExecutionEvent::Complete(result) => {
            store.complete(id, result.clone())?;
        }
        ExecutionEvent::Error { error, result, .. } => {
            store.fail(id, error, result.clone())?;
        }
        ExecutionEvent::Stopped { reason } => {
            store.fail(id, &format!("stopped: {reason}"), None)?;
        }
        _ => {}
    }
    Ok(())
}
