//! Engine entry point: wires the bus, store, project context, planner,
//! scheduler and HTTP surface together for one orchestration run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use arkaledge_events::{EngineEvent, EventBus, EventKind};
use arkaledge_store::{KanbanStore, Task, TaskStatus};

use crate::context::ProjectContext;
use crate::failure::FailureHandler;
use crate::health::HealthRegistry;
use crate::http::{self, AppState};
use crate::roles::run_planner;
use crate::runtime::AgentRuntime;
use crate::scheduler::{Engineer, ScheduleResult, Scheduler, SchedulerConfig};
use crate::team::TeamConfig;
use crate::worktree::WorktreeManager;

/// Engine-level options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Resume an existing board instead of planning from scratch.
    pub resume: bool,
    /// Port for the observability surface; `None` disables it.
    pub http_port: Option<u16>,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            resume: false,
            http_port: Some(http::DEFAULT_PORT),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Final state of one orchestration run.
#[derive(Debug)]
pub struct OrchestrationOutcome {
    pub schedule: ScheduleResult,
    pub tasks: Vec<Task>,
}

/// One long-running orchestration of a project.
pub struct Orchestrator {
    team: TeamConfig,
    /// Live runtimes keyed by agent id.
    runtimes: HashMap<String, Arc<dyn AgentRuntime>>,
    project_dir: PathBuf,
    options: EngineOptions,
    bus: EventBus,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        team: TeamConfig,
        runtimes: HashMap<String, Arc<dyn AgentRuntime>>,
        project_dir: impl Into<PathBuf>,
        options: EngineOptions,
        bus: EventBus,
    ) -> Self {
        Self {
            team,
            runtimes,
            project_dir: project_dir.into(),
            options,
            bus,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observers can use to tie into this run's lifetime.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a stop: flag the scheduler and abort every known runtime.
    /// Best-effort; backends may keep producing output that is discarded.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for runtime in self.runtimes.values() {
            runtime.abort().await;
        }
    }

    /// Run orchestration to completion.
    pub async fn run(&self, spec_text: &str) -> Result<OrchestrationOutcome> {
        let store = KanbanStore::new(&self.project_dir, self.bus.clone());

        // Fresh runs must not clobber an existing board.
        let existing_tasks = if store.state_exists() {
            store.get_all_tasks().context("existing kanban state is unreadable")?
        } else {
            Vec::new()
        };
        if !self.options.resume && !existing_tasks.is_empty() {
            bail!(
                "project at {} already has {} task(s); start with resume to continue it",
                self.project_dir.display(),
                existing_tasks.len()
            );
        }

        store.init().await?;
        let context = ProjectContext::load_or_build(&self.project_dir)?;

        let sm_id = self.team.scrum_master_id().to_owned();
        self.bus.emit(
            EngineEvent::new(
                EventKind::ProjectStarted,
                sm_id.as_str(),
                "scrum-master",
                "Orchestration started",
            )
            .with_data("projectDir", serde_json::json!(self.project_dir)),
        );

        // Observability surface runs for the whole orchestration.
        let http_handle = self.options.http_port.map(|port| {
            let state = AppState {
                store: store.clone(),
                bus: self.bus.clone(),
            };
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = http::run_server(state, port, cancel).await {
                    tracing::error!(error = %e, "observability server failed");
                }
            })
        });

        // Plan unless resuming an already-populated board.
        let resuming = self.options.resume && !existing_tasks.is_empty();
        if resuming {
            tracing::info!(
                tasks = existing_tasks.len(),
                "resuming existing board, skipping planner"
            );
        } else {
            let planner = self
                .team
                .planner()
                .context("team config declares no agents")?;
            let runtime = self
                .runtimes
                .get(&planner.id)
                .with_context(|| format!("no runtime for planner agent {}", planner.id))?;
            run_planner(
                runtime.as_ref(),
                planner,
                spec_text,
                &context,
                &store,
                &self.bus,
            )
            .await?;
        }

        // Assemble the engineer pool.
        let mut engineers = Vec::new();
        for spec in self.team.engineers() {
            let runtime = self
                .runtimes
                .get(&spec.id)
                .with_context(|| format!("no runtime for engineer agent {}", spec.id))?;
            engineers.push(Engineer {
                spec: spec.clone(),
                runtime: Arc::clone(runtime),
            });
        }
        if engineers.is_empty() {
            bail!("team config declares no engineers");
        }

        let scheduler = Scheduler {
            store: store.clone(),
            worktrees: WorktreeManager::new(&self.project_dir),
            bus: self.bus.clone(),
            context,
            team: self.team.clone(),
            engineers,
            health: Arc::new(HealthRegistry::new()),
            failure: Arc::new(FailureHandler::new(
                store.clone(),
                self.bus.clone(),
                self.team.clone(),
            )),
            config: self.options.scheduler.clone(),
            cancel: self.cancel.child_token(),
        };

        let schedule = scheduler.run().await?;

        let tasks = store.get_all_tasks()?;
        let done = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count();
        self.bus.emit(
            EngineEvent::new(
                EventKind::ProjectCompleted,
                sm_id.as_str(),
                "scrum-master",
                format!("Orchestration finished: {done}/{} tasks done", tasks.len()),
            )
            .with_data("result", serde_json::json!(format!("{schedule:?}"))),
        );

        // Tear the HTTP surface down with the run.
        self.cancel.cancel();
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }

        Ok(OrchestrationOutcome { schedule, tasks })
    }
}
