//! `arkaledge` binary: load the team config, build one runtime per agent,
//! and drive an orchestration run (fresh or resumed).

mod config;
mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use arkaledge_core::runtime::AgentRuntime;
use arkaledge_core::{EngineOptions, OrchestrationOutcome, Orchestrator, SchedulerConfig};
use arkaledge_events::EventBus;
use arkaledge_store::TaskStatus;

use process::ProcessRuntime;

#[derive(Parser)]
#[command(name = "arkaledge", about = "Autonomous software-engineering orchestrator")]
struct Cli {
    /// Project directory to orchestrate
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Team configuration file (default: <project-dir>/arkaledge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Observability server port
    #[arg(long, global = true, default_value_t = 4400)]
    port: u16,

    /// Disable the observability server
    #[arg(long, global = true)]
    no_http: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a specification and run the board to completion
    Run {
        /// Path to the specification file
        spec: PathBuf,
    },
    /// Resume an existing board without re-planning
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ARKALEDGE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = config::resolve_config_path(cli.config.clone(), &cli.project_dir);
    let file = config::load_config(&config_path)?;

    let (spec_text, resume) = match &cli.command {
        Commands::Run { spec } => {
            let text = std::fs::read_to_string(spec)
                .with_context(|| format!("failed to read spec file at {}", spec.display()))?;
            (text, false)
        }
        Commands::Resume => (String::new(), true),
    };

    // One runtime per agent, launched from the backend command table.
    let mut runtimes: HashMap<String, Arc<dyn AgentRuntime>> = HashMap::new();
    for agent in &file.team.agents {
        let backend = &file.backends[&agent.backend];
        runtimes.insert(
            agent.id.clone(),
            Arc::new(ProcessRuntime::new(backend, agent.model.as_str())),
        );
    }

    let options = EngineOptions {
        resume,
        http_port: (!cli.no_http).then_some(cli.port),
        scheduler: SchedulerConfig::default(),
    };
    let orchestrator = Arc::new(Orchestrator::new(
        file.team,
        runtimes,
        cli.project_dir.clone(),
        options,
        EventBus::new(),
    ));

    // ctrl-c requests a cooperative stop; the scheduler drains in-flight
    // work before the run returns.
    let stopper = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, stopping orchestration");
            stopper.stop().await;
        }
    });

    let outcome = orchestrator.run(&spec_text).await?;
    print_summary(&outcome);
    Ok(())
}

fn print_summary(outcome: &OrchestrationOutcome) {
    println!("\nResult: {:?}\n", outcome.schedule);
    for status in [
        TaskStatus::Backlog,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Done,
        TaskStatus::Blocked,
    ] {
        let tasks: Vec<_> = outcome
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .collect();
        if tasks.is_empty() {
            continue;
        }
        println!("{status} ({}):", tasks.len());
        for task in tasks {
            let note = task
                .last_status_change()
                .and_then(|h| h.detail.as_deref())
                .unwrap_or("");
            println!("  [{}] {} {note}", task.id, task.title);
        }
    }
}
