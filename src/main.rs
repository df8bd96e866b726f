use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use guardsymbi_core::config::EngineConfig;
use guardsymbi_core::decl::WorkflowFile;
use guardsymbi_core::event::EventBus;
use guardsymbi_engine::{Engine, EngineBuilder, RunLogger, RunReport};
use guardsymbi_modules::ModuleRegistry;

#[derive(Parser)]
#[command(name = "guardsymbi", version, about = "Guarded, self-healing task workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "guardsymbi.toml", global = true)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task and everything it depends on
    Run {
        /// Entry task (defaults to the workflow's run directive)
        task: Option<String>,
        /// Workflow declaration file (.toml or .json)
        #[arg(short, long)]
        workflow: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a workflow and print its execution order
    Check {
        #[arg(short, long)]
        workflow: PathBuf,
    },
    /// Print the tasks a run of TASK would execute, in order
    Plan {
        task: String,
        #[arg(short, long)]
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "guardsymbi=debug,warn"
    } else {
        "guardsymbi=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Check { workflow } => {
            let engine = build_engine(&workflow, &config).await?;
            let graph = engine.graph();
            println!("{} task(s), execution order:", graph.len());
            for (i, &id) in graph.order().iter().enumerate() {
                let deps: Vec<String> = graph
                    .deps(id)
                    .iter()
                    .map(|&d| graph.display_name(d))
                    .collect();
                if deps.is_empty() {
                    println!("  {}. {}", i + 1, graph.display_name(id));
                } else {
                    println!("  {}. {} <- {}", i + 1, graph.display_name(id), deps.join(", "));
                }
            }
        }
        Commands::Plan { task, workflow } => {
            let engine = build_engine(&workflow, &config).await?;
            for (i, name) in engine.plan(Some(&task))?.iter().enumerate() {
                println!("  {}. {}", i + 1, name);
            }
        }
        Commands::Run {
            task,
            workflow,
            json,
        } => {
            let engine = build_engine(&workflow, &config).await?;
            let report = run(&engine, &config, task.as_deref()).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
                if let Some(output) = &report.output {
                    println!("Output: {}", output);
                }
            }

            if !report.succeeded() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Load the config file, falling back to defaults when the default path is absent.
fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(EngineConfig::load(path)?)
    } else if path == Path::new("guardsymbi.toml") {
        Ok(EngineConfig::default())
    } else {
        anyhow::bail!("Config file not found: {}", path.display())
    }
}

async fn build_engine(workflow: &Path, config: &EngineConfig) -> anyhow::Result<Engine> {
    let declarations = WorkflowFile::load(workflow)?;
    info!(
        path = %workflow.display(),
        modules = declarations.modules.len(),
        "Loaded workflow"
    );

    let mut builder = EngineBuilder::new()
        .with_modules(declarations.modules)
        .with_registry(ModuleRegistry::with_builtins())
        .with_config(config.clone())
        .with_event_bus(Arc::new(EventBus::default()));

    if let Some(mcp) = &config.mcp {
        match guardsymbi_mcp::connect(mcp).await {
            Ok(transport) => {
                info!(transport = %transport.name(), "Connected to assistance server");
                builder = builder.with_assistant(transport);
            }
            Err(e) => warn!(error = %e, "Assistance server unavailable; AI calls will fail"),
        }
    }

    Ok(builder.build()?)
}

async fn run(
    engine: &Engine,
    config: &EngineConfig,
    task: Option<&str>,
) -> anyhow::Result<RunReport> {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let logger = config.log.as_ref().filter(|l| l.enabled).map(|l| {
        RunLogger::new(l.dir(), l.level).spawn(engine.event_bus(), CancellationToken::new())
    });

    let report = engine.run_with_cancel(task, cancel).await?;

    if let Some(handle) = logger {
        handle.await.ok();
    }
    Ok(report)
}
