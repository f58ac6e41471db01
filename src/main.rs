// ABOUTME: Main entry point for the harnex CLI
// ABOUTME: Lists harnesses, probes installs, discovers slash commands and runs prompts

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::future::join_all;
use harnex::config::Config;
use harnex_agent::{EnvelopeBody, Harness, HarnessCatalog, HarnessId, QueryOptions};
use harnex_core::{ExecutionRegistry, ExecutionStatus, QueryHost, StartRequest};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "harnex", about = "Drive coding-agent CLIs through one event model")]
struct Cli {
    /// Config file (overrides HARNEX_CONFIG_PATH and the default locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Harnesses the CLI can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HarnessArg {
    ClaudeCode,
    Codex,
}

impl From<HarnessArg> for HarnessId {
    fn from(arg: HarnessArg) -> Self {
        match arg {
            HarnessArg::ClaudeCode => HarnessId::ClaudeCode,
            HarnessArg::Codex => HarnessId::Codex,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show every harness with its capabilities and models
    List,
    /// Probe install and auth status
    Status {
        /// Only probe this harness
        #[arg(long, value_enum)]
        harness: Option<HarnessArg>,
    },
    /// Discover slash commands for a harness
    Commands {
        #[arg(long, value_enum)]
        harness: HarnessArg,
        /// Project directory to scan
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
    },
    /// Run a prompt and stream raw messages as JSON lines
    Run {
        #[arg(long, value_enum)]
        harness: HarnessArg,
        #[arg(long)]
        model: Option<String>,
        /// edit, plan or read_only
        #[arg(long, default_value = "edit")]
        mode: String,
        /// Session id to resume
        #[arg(long)]
        resume: Option<String>,
        /// Fork the resumed session instead of continuing it
        #[arg(long, requires = "resume")]
        fork: bool,
        /// off, low, medium or high
        #[arg(long)]
        thinking: Option<String>,
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let _log_guard = harnex::logging::init(&config.logging)?;
    tracing::debug!(
        claude_binary = %config.agent.claude_code.binary,
        codex_binary = %config.agent.codex.binary,
        "Configuration loaded"
    );

    let catalog = config.catalog();
    match cli.command {
        Command::List => list(&catalog),
        Command::Status { harness } => status(&catalog, harness.map(HarnessId::from)).await,
        Command::Commands { harness, cwd } => commands(&catalog, harness.into(), cwd).await,
        Command::Run {
            harness,
            model,
            mode,
            resume,
            fork,
            thinking,
            cwd,
            prompt,
        } => {
            let mut options = QueryOptions::new(cwd);
            options.model = model;
            options.mode = mode.parse()?;
            options.resume_session_id = resume;
            options.fork_session = fork;
            options.thinking = thinking.as_deref().map(str::parse).transpose()?;
            run(&config, catalog, harness.into(), &prompt, options).await
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list(catalog: &HarnessCatalog) -> Result<()> {
    let harnesses: Vec<_> = catalog
        .iter()
        .map(|h| {
            json!({
                "meta": h.meta(),
                "capabilities": h.capabilities(),
                "models": h.models(),
            })
        })
        .collect();
    print_json(&json!(harnesses))
}

async fn status(catalog: &HarnessCatalog, only: Option<HarnessId>) -> Result<()> {
    let harnesses: Vec<Arc<dyn Harness>> = match only {
        Some(id) => vec![catalog.get(id)?],
        None => catalog.iter().cloned().collect(),
    };
    let probes = harnesses.iter().map(|h| async move {
        json!({
            "harness": h.meta().id,
            "status": h.check_install_status().await,
        })
    });
    print_json(&json!(join_all(probes).await))
}

async fn commands(catalog: &HarnessCatalog, id: HarnessId, cwd: PathBuf) -> Result<()> {
    let harness = catalog.get(id)?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let found = harness.discover_slash_commands(&cwd, &cancel).await;
    print_json(&serde_json::to_value(found)?)
}

async fn run(
    config: &Config,
    catalog: HarnessCatalog,
    harness: HarnessId,
    prompt: &str,
    options: QueryOptions,
) -> Result<()> {
    let defaults = config.option_defaults(&catalog)?;
    let host = Arc::new(QueryHost::new(catalog));
    let registry = ExecutionRegistry::new(host, defaults);

    let execution = registry.start(prompt, StartRequest::new(harness, options))?;
    tracing::info!(execution_id = %execution.id(), harness = %harness, "Running prompt");

    let mut messages = execution.messages()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, aborting execution");
                execution.abort().await;
                break;
            }
            next = messages.next() => match next {
                Some(message) => println!("{}", serde_json::to_string(&message)?),
                None => break,
            },
        }
    }
    drop(messages);

    let state = execution.state();
    let summary = json!({
        "executionId": state.execution_id,
        "harness": state.harness_id,
        "status": state.status,
        "sessionId": state.session_id,
        "events": state.events.len(),
    });
    eprintln!("{}", serde_json::to_string(&summary)?);
    // Everything was printed; the host can drop what it kept for reattach
    if let Err(e) = execution.release_buffer() {
        tracing::debug!(error = %e, "Nothing to release");
    }
    registry.cleanup(execution.id());

    if state.status == ExecutionStatus::Error {
        let message = state
            .events
            .iter()
            .rev()
            .find_map(|e| match &e.body {
                EnvelopeBody::Error { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap_or_default();
        return Err(anyhow::anyhow!("{}", message)).context("Execution failed");
    }
    Ok(())
}
