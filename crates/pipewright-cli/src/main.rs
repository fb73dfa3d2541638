//! Pipewright - pipeline runner CLI
//!
//! The `pipewright` command executes pipeline definitions and manages their
//! artifact stores.
//!
//! ## Commands
//!
//! - `run`: Execute a pipeline definition once
//! - `validate`: Check a definition and print its execution order
//! - `prune`: Apply artifact retention to a pipeline's store
//! - `builds`: List builds recorded in a pipeline's store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

use pipewright_ci::{ArtifactCollector, CancelSignal, Controller};
use pipewright_core::domain::definition::is_path_safe;
use pipewright_core::{render_build_summary, BuildId, BuildRecord, BuildSequence, PipelineDefinition};

const DEFAULT_WORKSPACE_ROOT: &str = ".pipewright/workspaces";
const DEFAULT_STORE: &str = ".pipewright/store";

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run declarative build pipelines", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline definition (.toml or .json)
    Run {
        /// Path to the pipeline definition
        definition: PathBuf,

        /// Root under which build workspaces are created
        #[arg(long, env = "PIPEWRIGHT_WORKSPACE_ROOT", default_value = DEFAULT_WORKSPACE_ROOT)]
        workspace_root: PathBuf,

        /// Root of the artifact stores
        #[arg(long, env = "PIPEWRIGHT_STORE", default_value = DEFAULT_STORE)]
        store: PathBuf,

        /// Build number to use (default: one past the store's last build)
        #[arg(long)]
        build_number: Option<u64>,

        /// Print the finalized build record as JSON instead of a summary
        #[arg(long)]
        json_record: bool,
    },

    /// Validate a definition and print the stage execution order
    Validate {
        /// Path to the pipeline definition
        definition: PathBuf,
    },

    /// Keep only the most recent builds of a pipeline
    Prune {
        /// Pipeline name
        pipeline: String,

        /// Number of builds to keep
        #[arg(short, long, default_value_t = pipewright_core::domain::DEFAULT_BUILDS_TO_KEEP)]
        keep: usize,

        /// Root of the artifact stores
        #[arg(long, env = "PIPEWRIGHT_STORE", default_value = DEFAULT_STORE)]
        store: PathBuf,
    },

    /// List builds recorded for a pipeline
    Builds {
        /// Pipeline name
        pipeline: String,

        /// Root of the artifact stores
        #[arg(long, env = "PIPEWRIGHT_STORE", default_value = DEFAULT_STORE)]
        store: PathBuf,

        /// Print the listing as JSON
        #[arg(long)]
        as_json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    pipewright_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            definition,
            workspace_root,
            store,
            build_number,
            json_record,
        } => {
            let record = cmd_run(&definition, workspace_root, store, build_number).await?;
            if json_record {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print!("{}", render_build_summary(&record));
            }
            std::process::exit(record.status.exit_code());
        }
        Commands::Validate { definition } => cmd_validate(&definition),
        Commands::Prune {
            pipeline,
            keep,
            store,
        } => cmd_prune(&store, &pipeline, keep),
        Commands::Builds {
            pipeline,
            store,
            as_json,
        } => cmd_builds(&store, &pipeline, as_json),
    }
}

/// Execute one build. Ctrl-C aborts it; cleanup still runs.
async fn cmd_run(
    definition: &Path,
    workspace_root: PathBuf,
    store: PathBuf,
    build_number: Option<u64>,
) -> Result<BuildRecord> {
    let def = PipelineDefinition::from_path(definition)
        .with_context(|| format!("Failed to load definition {:?}", definition))?;
    let controller = Controller::process(workspace_root, store);

    let build_id = match build_number {
        Some(n) => BuildId(n),
        None => {
            let collector = controller
                .open_collector(&def.name)
                .context("Failed to open artifact store")?;
            BuildSequence::starting_after(collector.last_build_id()).next()
        }
    };

    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting build");
            trigger.cancel("interrupted");
        }
    });

    info!(pipeline = %def.name, build = build_id.0, "Starting build");
    let result = controller
        .execute_pipeline_with_cancel(&def, build_id, &cancel)
        .await;
    interrupt.abort();

    result.with_context(|| format!("Build #{} of {} could not run", build_id, def.name))
}

fn cmd_validate(definition: &Path) -> Result<()> {
    let def = PipelineDefinition::from_path(definition)
        .with_context(|| format!("Invalid definition {:?}", definition))?;

    println!("Pipeline: {}", def.name);
    println!("Stages digest: {}", def.stages_digest());
    println!(
        "Timeout: {}m, builds to keep: {}",
        def.config.timeout_minutes, def.config.builds_to_keep
    );
    println!();
    for (i, stage) in def.execution_order()?.iter().enumerate() {
        let mut line = format!("  {}. {} ({} commands)", i + 1, stage.name, stage.commands.len());
        if !stage.enabled {
            line.push_str(" disabled");
        }
        if stage.non_fatal {
            line.push_str(" non-fatal");
        }
        if !stage.needs.is_empty() {
            line.push_str(&format!(" needs: {}", stage.needs.join(", ")));
        }
        println!("{}", line);
    }
    Ok(())
}

/// Open the artifact store of one pipeline under `store`.
fn open_store(store: &Path, pipeline: &str) -> Result<ArtifactCollector> {
    if !is_path_safe(pipeline) {
        anyhow::bail!("Invalid pipeline name: {:?}", pipeline);
    }
    ArtifactCollector::open(store.join(pipeline))
        .with_context(|| format!("Failed to open artifact store for {}", pipeline))
}

fn cmd_prune(store: &Path, pipeline: &str, keep: usize) -> Result<()> {
    let mut collector = open_store(store, pipeline)?;
    let report = collector.prune(keep)?;

    if report.pruned.is_empty() {
        println!("Nothing to prune");
    } else {
        let ids: Vec<String> = report.pruned.iter().map(|b| b.to_string()).collect();
        println!("Pruned builds: {}", ids.join(", "));
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    Ok(())
}

#[derive(Serialize)]
struct BuildListing {
    build: u64,
    started_at: String,
    artifacts: usize,
    pruned: bool,
}

fn list_builds(store: &Path, pipeline: &str) -> Result<Vec<BuildListing>> {
    let collector = open_store(store, pipeline)?;
    Ok(collector
        .builds()
        .map(|b| BuildListing {
            build: b.build_id.0,
            started_at: b.started_at.to_rfc3339(),
            artifacts: b.artifacts.len(),
            pruned: b.pruned,
        })
        .collect())
}

fn cmd_builds(store: &Path, pipeline: &str, as_json: bool) -> Result<()> {
    let builds = list_builds(store, pipeline)?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&builds)?);
        return Ok(());
    }
    if builds.is_empty() {
        println!("No builds recorded for {}", pipeline);
        return Ok(());
    }
    for b in &builds {
        println!(
            "  #{} {} ({} artifacts{})",
            b.build,
            b.started_at,
            b.artifacts,
            if b.pruned { ", pruned" } else { "" }
        );
    }
    Ok(())
}
