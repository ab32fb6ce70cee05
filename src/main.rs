use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokenflow_core::config::FlowConfig;
use tokenflow_core::definition::WorkflowDefinition;
use tokenflow_engine::RunStore;

#[derive(Parser)]
#[command(name = "tokenflow", version, about = "Token-based workflow coordinator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tokenflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a workflow definition
    Check {
        /// Path to the definition JSON
        definition: PathBuf,
    },
    /// Show current configuration
    Config,
    /// List persisted runs, most recent first
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print a persisted run record
    Show {
        run_id: String,
        /// Print every token instead of a per-status summary
        #[arg(long)]
        tokens: bool,
    },
    /// List the snapshots stored for a run
    Snapshots { run_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tokenflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = FlowConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Check { definition } => check(&definition),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Runs { limit } => {
            let store = open_store(&config)?;
            let runs = store.list_runs(limit)?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for run in runs {
                println!(
                    "{}  {:<9}  {}  {}{}",
                    run.id,
                    run.status.as_str(),
                    run.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    run.workflow_ref,
                    run.parent_run_id
                        .map(|p| format!("  (child of {})", p))
                        .unwrap_or_default(),
                );
            }
            Ok(())
        }
        Commands::Show { run_id, tokens } => {
            let store = open_store(&config)?;
            let record = store
                .load_run(&run_id)?
                .with_context(|| format!("no run with id {}", run_id))?;

            println!("Run:       {}", record.id);
            println!("Workflow:  {}", record.workflow_ref);
            println!("Status:    {}", record.status);
            println!("Updated:   {}", record.updated_at.to_rfc3339());
            println!("Sequence:  {}", record.last_sequence);
            if let Some(parent) = &record.parent_run_id {
                println!("Parent:    {}", parent);
            }
            if let Some(failure) = &record.failure {
                println!("Failure:   [{}] {}", failure.kind, failure.message);
            }
            if let Some(output) = &record.final_output {
                println!("Output:    {}", serde_json::to_string(output)?);
            }

            if tokens {
                println!("\nTokens:");
                for t in &record.tokens {
                    let branch = t
                        .branch()
                        .map(|b| format!(" {}[{}/{}]", b.sibling_group, b.branch_index, b.branch_total))
                        .unwrap_or_default();
                    println!("  {}  {:<20}  {}{}", t.id, t.status.as_str(), t.node_ref, branch);
                }
            } else {
                let mut counts = std::collections::BTreeMap::new();
                for t in &record.tokens {
                    *counts.entry(t.status.as_str()).or_insert(0usize) += 1;
                }
                let summary: Vec<String> = counts.iter().map(|(s, n)| format!("{}={}", s, n)).collect();
                println!("Tokens:    {} ({})", record.tokens.len(), summary.join(", "));
            }
            Ok(())
        }
        Commands::Snapshots { run_id } => {
            let store = open_store(&config)?;
            let snapshots = store.snapshots(&run_id)?;
            if snapshots.is_empty() {
                println!("No snapshots for run {}.", run_id);
            }
            for s in snapshots {
                println!(
                    "#{:<6} {:<12} {}",
                    s.sequence,
                    s.reason.as_str(),
                    s.taken_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(path)
        .with_context(|| format!("invalid definition {}", path.display()))?;

    println!("Workflow:    {}", definition.reference());
    println!("Initial:     {}", definition.initial_node_ref);
    println!("Nodes:       {}", definition.nodes.len());
    println!("Transitions: {}", definition.transitions.len());
    for t in &definition.transitions {
        let kind = if t.is_fan_out() {
            format!("fan-out x{} ({})", t.spawn_count(), t.sibling_group.as_deref().unwrap_or(""))
        } else if let Some(sync) = &t.synchronization {
            format!("join {:?} ({})", sync.strategy, sync.sibling_group).to_lowercase()
        } else {
            "continue".to_string()
        };
        println!("  {:<28} {}", t.id, kind);
    }
    let predicates = definition.predicate_names();
    if !predicates.is_empty() {
        println!("Predicates:  {}", predicates.join(", "));
    }
    Ok(())
}

fn open_store(config: &FlowConfig) -> anyhow::Result<RunStore> {
    let path = config.store_path();
    if !config.store.enabled {
        warn!("Run store is disabled in config; reading {} anyway", path.display());
    }
    if !path.exists() {
        anyhow::bail!("run store not found at {}", path.display());
    }
    RunStore::open(&path).with_context(|| format!("opening {}", path.display()))
}
