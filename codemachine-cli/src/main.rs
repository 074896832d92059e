//! Codemachine CLI.
//!
//! Drives multi-step AI agent workflows from the terminal: `start` runs
//! the workflow in the current directory, `auth` manages engine
//! credentials.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use codemachine::bus::{ControlBus, ControlEvent};
use codemachine::config::{Config, EnginePreset, Tier};
use codemachine::engine::{default_registry, FallbackRunner, RateLimitManager};
use codemachine::error::{EngineError, Error, Result, ValidationError};
use codemachine::monitor::AgentMonitor;
use codemachine::workflow::{
    AgentCatalog, AgentSpec, ExecutorState, StepRunner, WorkflowExecutorBuilder,
    WorkflowStateStore, WorkflowStep,
};

/// Codemachine — multi-engine AI workflow orchestrator
#[derive(Parser)]
#[command(name = "codemachine")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow in the current directory
    Start(StartArgs),

    /// Inspect or establish engine credentials
    Auth(AuthArgs),
}

/// Arguments for the start command
#[derive(Args)]
struct StartArgs {
    /// Specification file (default: .codemachine/inputs/specifications.md)
    #[arg(long)]
    spec: Option<PathBuf>,

    /// Engine for every step (must be a registered engine id)
    #[arg(long)]
    engine: Option<String>,

    /// Built-in preset mapping workload tiers to engines
    #[arg(long)]
    preset: Option<String>,
}

/// Arguments for the auth command
#[derive(Args)]
struct AuthArgs {
    /// Engine to authenticate; omit to list every engine's status
    engine: Option<String>,

    /// Discard credentials instead of establishing them
    #[arg(long)]
    clear: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error[{}]: {e}", e.code());
            return ExitCode::FAILURE;
        }
    };
    init_logging(cli.verbose, &config);

    let result = match cli.command {
        Commands::Start(args) => start(args, &config).await,
        Commands::Auth(args) => auth(args, &config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.code(), "command failed");
            eprintln!("error[{}]: {e}", e.code());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, config: &Config) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = config
        .log_filter
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| format!("codemachine={default_level}"));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_ansi(!config.plain_logs)
        .with_target(false)
        .init();
}

async fn start(args: StartArgs, config: &Config) -> Result<()> {
    let paths = config.workflow_paths();
    paths.ensure_layout().await?;

    let registry = Arc::new(default_registry(config));
    if let Some(engine) = &args.engine {
        if !registry.contains(engine) {
            return Err(EngineError::NotFound(engine.clone()).into());
        }
    }
    let preset = match &args.preset {
        Some(name) => Some(EnginePreset::builtin(name).ok_or_else(|| {
            Error::from(ValidationError::InvalidField {
                field: "preset".to_string(),
                message: format!(
                    "unknown preset '{name}' (built-ins: {})",
                    EnginePreset::builtin_names().join(", ")
                ),
            })
        })?),
        None => None,
    };

    let spec_path = args.spec.unwrap_or_else(|| paths.specification());
    validate_specification(&spec_path).await?;

    let rate_limits = Arc::new(RateLimitManager::initialize(paths.rate_limits()).await?);
    let monitor = Arc::new(AgentMonitor::open(paths.registry_db())?);

    let mut step_runner = StepRunner::new(
        FallbackRunner::new(Arc::clone(&registry), rate_limits),
        monitor,
        default_catalog(&spec_path),
        &config.cwd,
    );
    if let Some(preset) = preset {
        step_runner = step_runner.with_preset(preset);
    }
    if let Some(engine) = args.engine {
        step_runner = step_runner.with_global_engine(engine);
    }

    let bus = ControlBus::new();
    let executor = WorkflowExecutorBuilder::new(default_steps(), step_runner, bus.clone())
        .state_store(WorkflowStateStore::new(&paths))
        .build();

    // Ctrl-C is a user stop, delivered over the bus like any other signal.
    let signal_bus = bus.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_bus.emit(&ControlEvent::UserStop);
        }
    });

    info!(workflow = executor.workflow_id(), "starting workflow");
    match executor.run().await? {
        ExecutorState::Completed => {
            println!("Workflow {} completed", executor.workflow_id());
            Ok(())
        }
        ExecutorState::Stopped => {
            println!(
                "Workflow aborted: stopped by user (workflow {})",
                executor.workflow_id()
            );
            Err(codemachine::error::WorkflowError::Aborted("stopped by user".to_string()).into())
        }
        other => {
            println!(
                "Workflow {} ended in state {other}",
                executor.workflow_id()
            );
            Ok(())
        }
    }
}

async fn validate_specification(path: &std::path::Path) -> Result<()> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => {
            return Err(
                ValidationError::SpecificationMissing(path.display().to_string()).into(),
            );
        }
    };
    if content.trim().is_empty() {
        return Err(ValidationError::SpecificationEmpty.into());
    }
    Ok(())
}

/// The built-in workflow agents. The specification is threaded into each
/// prompt through a `{file:…}` placeholder.
fn default_catalog(spec_path: &std::path::Path) -> AgentCatalog {
    let spec = spec_path.display();
    AgentCatalog::new()
        .with(
            "architect",
            AgentSpec {
                prompt: format!(
                    "Design an implementation plan for the following specification.\n\n{{file:{spec}}}"
                ),
                tier: Tier::Complex,
                ..AgentSpec::default()
            },
        )
        .with(
            "implementer",
            AgentSpec {
                prompt: format!(
                    "Implement the plan produced for this specification.\n\n{{file:{spec}}}"
                ),
                tier: Tier::Standard,
                ..AgentSpec::default()
            },
        )
        .with(
            "reviewer",
            AgentSpec {
                prompt: "Review the implementation for defects and missed requirements."
                    .to_string(),
                tier: Tier::Simple,
                ..AgentSpec::default()
            },
        )
}

fn default_steps() -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::module("architect"),
        WorkflowStep::UiCheckpoint {
            reason: "review the implementation plan".to_string(),
        },
        WorkflowStep::module("implementer"),
        WorkflowStep::module("reviewer"),
    ]
}

async fn auth(args: AuthArgs, config: &Config) -> Result<()> {
    let registry = default_registry(config);

    match args.engine {
        Some(engine) => {
            if args.clear {
                registry.clear_auth(&engine).await?;
                println!("{engine}: credentials cleared");
            } else {
                registry.ensure_auth(&engine).await?;
                println!("{engine}: authenticated");
            }
            Ok(())
        }
        None => {
            for engine in registry.all() {
                let status = match registry.is_authenticated(engine.id()).await {
                    Ok(true) => "authenticated",
                    Ok(false) => "not authenticated",
                    Err(_) => "unavailable",
                };
                let experimental = if engine.experimental() {
                    " (experimental)"
                } else {
                    ""
                };
                println!("{:<10} {status}{experimental}", engine.id());
            }
            Ok(())
        }
    }
}
