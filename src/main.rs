use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use capsule_core::config::AppConfig;
use capsule_core::graph::StepGraph;
use capsule_engine::{CapsuleEngine, FileRunStore, RunLogger};
use capsule_tools::{EvidenceIndex, ToolRegistry};

#[derive(Parser)]
#[command(name = "capsule", version, about = "Run compiled step graphs once, with cited output")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "capsule.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a step graph and print its run record
    Run {
        /// Graph JSON file, or `-` for stdin
        graph: PathBuf,
    },
    /// Check a step graph without running it
    Validate {
        /// Graph JSON file, or `-` for stdin
        graph: PathBuf,
    },
    /// Show effective configuration
    Config,
    /// List the tools available to graphs
    Tools,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("capsule=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "capsule", &mut std::io::stdout());
        }
        Commands::Validate { graph } => {
            let graph = read_graph(&graph)?;
            println!(
                "graph {} is valid ({} steps)",
                graph.id,
                graph.step_plan.len()
            );
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Tools => {
            let config = load_config(&cli.config)?;
            let tools = build_registry(&config).await?;
            println!("{}", serde_json::to_string_pretty(&tools.definitions())?);
        }
        Commands::Run { graph } => {
            let graph = read_graph(&graph)?;
            let config = load_config(&cli.config)?;
            run_graph(&config, &graph).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load_or_default(path)?;
    if path.exists() {
        info!(path = %path.display(), "Config loaded");
    }
    Ok(config)
}

async fn run_graph(config: &AppConfig, graph: &StepGraph) -> anyhow::Result<()> {
    let tools = Arc::new(build_registry(config).await?);
    let mut engine = CapsuleEngine::new(tools, config.engine.clone());
    if let Some(dir) = config.artifacts_dir() {
        engine = engine.with_store(Arc::new(FileRunStore::new(dir)));
    }

    // Spawn RunLogger if logging is enabled
    let log_cancel = CancellationToken::new();
    let logger = config.log_dir().map(|log_dir| {
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        let logger = RunLogger::new(log_dir, level);
        let rx = engine.event_bus().subscribe();
        info!("RunLogger started (level {})", level);
        tokio::spawn(logger.run(rx, graph.id.clone(), log_cancel.clone()))
    });

    let result = engine.execute(graph).await;

    if let Some(handle) = logger {
        if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
            warn!("RunLogger did not finish in time");
        }
        log_cancel.cancel();
    }

    match result {
        Ok(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Err(e) => {
            if let Some(record) = e.run_record() {
                println!("{}", serde_json::to_string_pretty(record)?);
            }
            Err(anyhow::anyhow!("[{}] {}", e.code(), e))
        }
    }
}

/// Built-in tools; `retrieve_evidence` only when an evidence index is configured.
async fn build_registry(config: &AppConfig) -> anyhow::Result<ToolRegistry> {
    let index = match &config.evidence {
        Some(evidence) => {
            let index = EvidenceIndex::load(Path::new(&evidence.index_path), &evidence.collection)
                .await?;
            Some(Arc::new(index))
        }
        None => None,
    };
    Ok(ToolRegistry::with_builtins(index))
}

fn read_graph(path: &Path) -> anyhow::Result<StepGraph> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read graph {}", path.display()))?
    };
    StepGraph::from_json(&raw).map_err(|e| anyhow::anyhow!("[{}] {}", e.code(), e))
}
