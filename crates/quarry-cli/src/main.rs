//! Quarry CLI - multi-agent research runs
//!
//! Usage:
//!   quarry init                 Write a default .quarry/config.toml
//!   quarry run --job <file>     Run every enabled agent on a job
//!   quarry status <run_id>      Show a run's snapshot
//!   quarry runs                 List recent runs
//!   quarry events <run_id>      Show a run's event log

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quarry_agent::{build_agents, CredentialStore};
use quarry_core::{QuarryConfig, RunSnapshot, CONFIG_PATH};
use quarry_orchestrator::{FileContextLoader, Orchestrator, OrchestratorConfig, RunRequest};
use quarry_registry::RunRegistry;
use quarry_tools::ToolManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(author, version, about = "Multi-agent research orchestration")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project root holding .quarry/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Config file (defaults to <root>/.quarry/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Run all enabled agents on a job
    Run {
        /// JSON file with the job context
        #[arg(long, value_name = "FILE")]
        job: PathBuf,

        /// Project id (defaults to the configured default project)
        #[arg(long)]
        project: Option<String>,

        /// Explicit run id
        #[arg(long)]
        run_id: Option<String>,

        /// Skip external calls
        #[arg(long)]
        dry_run: bool,

        /// Where to write aggregated results (defaults to the run's state directory)
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Show a run's snapshot
    Status {
        run_id: String,
    },

    /// List recent runs, most recent first
    Runs {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show a run's event log
    Events {
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.root, force),
        Commands::Run {
            job,
            project,
            run_id,
            dry_run,
            output,
        } => {
            let config = load_config(&cli.root, cli.config.as_deref())?;
            cmd_run(&cli.root, config, job, project, run_id, dry_run, output).await
        }
        Commands::Status { run_id } => {
            let config = load_config(&cli.root, cli.config.as_deref())?;
            cmd_status(&registry(&cli.root, &config), &run_id).await
        }
        Commands::Runs { limit } => {
            let config = load_config(&cli.root, cli.config.as_deref())?;
            cmd_runs(&registry(&cli.root, &config), limit).await
        }
        Commands::Events { run_id } => {
            let config = load_config(&cli.root, cli.config.as_deref())?;
            cmd_events(&registry(&cli.root, &config), &run_id).await
        }
    }
}

fn load_config(root: &Path, explicit: Option<&Path>) -> Result<QuarryConfig> {
    let config = match explicit {
        Some(path) => QuarryConfig::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => QuarryConfig::load_or_default(root).context("Failed to load config")?,
    };
    Ok(config)
}

fn state_dir(root: &Path, config: &QuarryConfig) -> PathBuf {
    if config.run.state_dir.is_absolute() {
        config.run.state_dir.clone()
    } else {
        root.join(&config.run.state_dir)
    }
}

fn registry(root: &Path, config: &QuarryConfig) -> RunRegistry {
    RunRegistry::file(state_dir(root, config))
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let path = root.join(CONFIG_PATH);
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    let written = QuarryConfig::write_default(root)?;
    println!("Initialized Quarry in {}", root.display());
    println!("Created:");
    println!("  {}", written.display());
    println!("\nAll example tools and agents are disabled; enable them to start.");
    Ok(())
}

async fn cmd_run(
    root: &Path,
    config: QuarryConfig,
    job: PathBuf,
    project: Option<String>,
    run_id: Option<String>,
    dry_run: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let state_dir = state_dir(root, &config);
    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let project = project.unwrap_or_else(|| config.run.default_project.clone());
    let report_path = output.unwrap_or_else(|| state_dir.join(&run_id).join("results.json"));

    // One HTTP client for the whole run, shared by tools and agents
    let client = reqwest::Client::builder()
        .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let tools = Arc::new(ToolManager::from_config(
        &config.tools,
        client.clone(),
        config.retry.policy(),
    )?);
    let credentials = CredentialStore::new(config.secrets.clone());
    let agents = build_agents(&config, Arc::clone(&tools), client, credentials, dry_run);

    let registry = Arc::new(RunRegistry::file(&state_dir));
    let orchestrator = Orchestrator::new(registry, OrchestratorConfig::from_settings(&config.run));

    let request = RunRequest::new(project)
        .with_run_id(&run_id)
        .with_config_ref(root.join(CONFIG_PATH).display().to_string())
        .with_param("job", job.display().to_string())
        .with_param("dry_run", dry_run || config.run.dry_run)
        .with_report_path(report_path);

    info!("Run {}: {} active agents", run_id, agents.len());
    let outcome = orchestrator
        .execute(request, &FileContextLoader::new(&job), &agents)
        .await;
    tools.close().await;
    let outcome = outcome.with_context(|| format!("Run {} failed", run_id))?;

    println!("\nRun {} {}", outcome.snapshot.run_id, outcome.snapshot.status);
    println!("==========");
    if outcome.results.is_empty() {
        println!("No active agents. Enable agents in {}.", CONFIG_PATH);
    }
    for result in &outcome.results {
        println!(
            "  {:<20} {:<20} items={:<5} cost=${:.4} retries={}",
            result.agent_id,
            result.status.to_string(),
            result.items_found(),
            result.cost(),
            result.retry_count
        );
        for error in &result.errors {
            println!("      {}: {}", error.kind, error.message);
        }
    }
    println!("\nTotal cost: ${:.4}", outcome.snapshot.total_cost);
    if let Some(report) = &outcome.snapshot.report_path {
        println!("Results: {}", report);
    }
    let stats = tools.cache_stats();
    if stats.hits + stats.misses > 0 {
        println!("Tool cache: {} hits, {} misses", stats.hits, stats.misses);
    }
    Ok(())
}

async fn cmd_status(registry: &RunRegistry, run_id: &str) -> Result<()> {
    let snapshot = registry
        .load_snapshot(run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    println!("Run {}", snapshot.run_id);
    println!("==========");
    println!("Project:  {}", snapshot.project_id);
    println!("Status:   {}", snapshot.status);
    if let Some(phase) = &snapshot.phase {
        println!("Phase:    {} ({}%)", phase, snapshot.percent_complete);
    }
    println!("Created:  {}", snapshot.created_at);
    if let Some(started) = snapshot.started_at {
        println!("Started:  {}", started);
    }
    if let Some(completed) = snapshot.completed_at {
        println!("Finished: {}", completed);
    }
    println!("Cost:     ${:.4}", snapshot.total_cost);
    if let Some(error) = &snapshot.error {
        println!("Error:    {}", error);
    }
    if let Some(report) = &snapshot.report_path {
        println!("Results:  {}", report);
    }

    if !snapshot.providers.is_empty() {
        println!("\nAgents:");
        for provider in snapshot.providers.values() {
            println!(
                "  {:<20} {:<10} items={:<5} cost=${:.4}",
                provider.name,
                provider.status.to_string(),
                provider.items_found,
                provider.cost
            );
            if let Some(error) = &provider.error {
                println!("      {}", error);
            }
        }
    }
    Ok(())
}

async fn cmd_runs(registry: &RunRegistry, limit: usize) -> Result<()> {
    let snapshots = registry.list_snapshots(limit).await?;
    if snapshots.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for snapshot in &snapshots {
        print_run_line(snapshot);
    }
    Ok(())
}

fn print_run_line(snapshot: &RunSnapshot) {
    println!(
        "{:<38} {:<10} {:>3}%  {:<16} {}",
        snapshot.run_id,
        snapshot.status.to_string(),
        snapshot.percent_complete,
        snapshot.project_id,
        snapshot.started_or_created().format("%Y-%m-%d %H:%M:%S")
    );
}

async fn cmd_events(registry: &RunRegistry, run_id: &str) -> Result<()> {
    let events = registry.load_events(run_id).await?;
    if events.is_empty() {
        println!("No events for run {}.", run_id);
        return Ok(());
    }
    for event in &events {
        println!(
            "{:>4}  {}  {:<22} {}",
            event.seq,
            event.timestamp.format("%H:%M:%S%.3f"),
            event.event_type,
            event.payload
        );
    }
    Ok(())
}
