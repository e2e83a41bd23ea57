//! Tiller command line.
//!
//! `tiller run` executes a policy end-to-end and streams the run's events
//! as NDJSON; `tiller fold` reconstructs a snapshot from a recorded
//! stream; `tiller plan` shows the compiled plan without running it.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tiller_core::Policy;
use tiller_engine::{AgentRegistry, EngineConfig, ExecutionEngine, MemorySink, PlanCompiler};
use tiller_observer::{codec, fold};

#[derive(Parser)]
#[command(name = "tiller", version, about = "Multi-agent portfolio construction workflows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a policy end-to-end and emit the event stream as NDJSON.
    Run {
        /// Path to the policy JSON file.
        #[arg(long)]
        policy: PathBuf,
        /// Write events here instead of stdout, and print the snapshot.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Engine configuration TOML.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Fold a recorded NDJSON stream into a snapshot.
    Fold {
        /// Path to the NDJSON event stream.
        #[arg(long)]
        input: PathBuf,
    },
    /// Show the compiled plan for a policy without running it.
    Plan {
        /// Path to the policy JSON file.
        #[arg(long)]
        policy: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { policy, out, config } => cmd_run(&policy, out.as_deref(), config.as_deref()).await,
        Command::Fold { input } => cmd_fold(&input),
        Command::Plan { policy } => cmd_plan(&policy),
    }
}

fn load_policy(path: &Path) -> Result<Policy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading policy file {}", path.display()))?;
    let policy: Policy =
        serde_json::from_str(&raw).with_context(|| format!("parsing policy {}", path.display()))?;
    Ok(policy)
}

async fn cmd_run(policy_path: &Path, out: Option<&Path>, config_path: Option<&Path>) -> Result<()> {
    let policy = load_policy(policy_path)?;
    let config = match config_path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let engine = ExecutionEngine::new(AgentRegistry::standard(), config, MemorySink::new());
    let result = engine.run(&policy).await;
    let events = engine.into_sink().collected().await;
    info!(events = events.len(), "run emitted its event stream");

    // The stream is written even for failed runs; the events up to the
    // failure are valid and foldable.
    match out {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            codec::write_stream(&mut file, &events)?;
            let snapshot = fold(&events);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            codec::write_stream(&mut handle, &events)?;
            handle.flush()?;
        }
    }

    result.context("run failed")?;
    Ok(())
}

fn cmd_fold(input: &Path) -> Result<()> {
    let file =
        File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let events = codec::read_stream(BufReader::new(file))?;
    let snapshot = fold(&events);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn cmd_plan(policy_path: &Path) -> Result<()> {
    let policy = load_policy(policy_path)?;
    policy.validate().context("invalid policy")?;
    let plan = PlanCompiler::new(AgentRegistry::standard()).compile(&policy);

    println!("selected agents:");
    for planned in &plan.selected {
        println!(
            "  {:<26} [{}] {}",
            planned.agent.id,
            planned.agent.stage.id(),
            planned.reason
        );
    }
    println!("excluded agents:");
    for excluded in &plan.excluded {
        println!("  {:<26} {}", excluded.agent.id, excluded.reason);
    }
    Ok(())
}
