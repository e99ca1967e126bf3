//! The scrum master: a single cooperatively scheduled loop that sweeps
//! blocked tasks, detects termination, assigns ready work to healthy idle
//! engineers, dispatches reviews, and emits a per-tick summary.
//!
//! The loop is the only mutator of scheduler state (idle set, in-flight
//! map, review claims); spawned role executions report back over a
//! completion channel, never by touching shared state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use arkaledge_events::{EngineEvent, EventBus, EventKind};
use arkaledge_store::{Actor, KanbanStore, Task, TaskPatch, TaskStatus};

use crate::context::ProjectContext;
use crate::failure::FailureHandler;
use crate::health::HealthRegistry;
use crate::roles::{has_nonzero_exit, Executor, Reviewer};
use crate::runtime::{AgentRuntime, MessageKind, RunOptions};
use crate::team::{AgentSpec, TeamConfig};
use crate::watchdog::{consume_stream, WatchdogLimits};
use crate::worktree::WorktreeManager;

/// Fixed probe prompt; a healthy backend echoes the token back.
const PROBE_PROMPT: &str = "reply exactly HEALTH_OK";

/// Transcript substrings that mark a probed backend unhealthy.
const UNHEALTHY_PATTERNS: &[&str] = &[
    "rate limit",
    "limit reached",
    "usage limit",
    "unauthorized",
    "forbidden",
    "invalid api key",
    "authentication",
];

/// Maximum characters of a title carried into a branch slug.
const SLUG_MAX_CHARS: usize = 40;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between poll loop ticks.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// An engineer: a roster entry bound to a live runtime.
#[derive(Clone)]
pub struct Engineer {
    pub spec: AgentSpec,
    pub runtime: Arc<dyn AgentRuntime>,
}

/// How the scheduler loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleResult {
    /// Every task reached `done`.
    Completed,
    /// Remaining tasks are blocked or depend on blocked work.
    Stalled { stuck_tasks: Vec<String> },
    /// Cancellation was requested.
    Interrupted,
}

/// What kind of work an engineer is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkKind {
    Execute,
    Review,
    Probe,
}

/// Message sent from spawned work back to the loop.
struct WorkDone {
    engineer_id: String,
    task_id: Option<String>,
    kind: WorkKind,
    crashed: Option<String>,
}

/// The scrum master loop and its collaborators.
pub struct Scheduler {
    pub store: KanbanStore,
    pub worktrees: WorktreeManager,
    pub bus: EventBus,
    pub context: ProjectContext,
    pub team: TeamConfig,
    pub engineers: Vec<Engineer>,
    pub health: Arc<HealthRegistry>,
    pub failure: Arc<FailureHandler>,
    pub config: SchedulerConfig,
    pub cancel: CancellationToken,
}

impl Scheduler {
    fn actor(&self) -> Actor<'_> {
        Actor {
            id: self.team.scrum_master_id(),
            role: "scrum-master",
        }
    }

    /// Run the loop until every task is done, the board is stuck, or
    /// cancellation is requested. Remaining work handles are drained
    /// before returning.
    pub async fn run(&self) -> Result<ScheduleResult> {
        self.preflight_probes().await;

        let (tx, mut rx) = mpsc::channel::<WorkDone>(self.engineers.len().max(1) * 2);
        let mut busy: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut reviewing: HashSet<String> = HashSet::new();

        let result = loop {
            if self.cancel.is_cancelled() {
                break ScheduleResult::Interrupted;
            }

            // Collect finished work (non-blocking).
            while let Ok(done) = rx.try_recv() {
                self.on_work_done(&done, &mut busy, &mut reviewing);
            }

            // 1. Blocked sweep, so termination sees the latest pipeline
            // outcome for every blocked task.
            for task in self.store.get_tasks_by_status(TaskStatus::Blocked)? {
                self.failure.handle_blocked(&task).await?;
            }

            // 2. Termination test.
            let tasks = self.store.get_all_tasks()?;
            let active: Vec<&Task> = tasks.iter().filter(|t| !t.status.is_terminal()).collect();
            if active.is_empty() {
                break ScheduleResult::Completed;
            }
            let stuck = compute_stuck(&tasks);
            if busy.is_empty() && active.iter().all(|t| stuck.contains(&t.id)) {
                let mut stuck_tasks: Vec<String> = stuck.into_iter().collect();
                stuck_tasks.sort();
                break ScheduleResult::Stalled { stuck_tasks };
            }

            // 3. Assignment pass.
            let mut claimed: HashSet<String> = HashSet::new();
            self.assignment_pass(&tasks, &mut busy, &mut claimed, &tx)
                .await?;

            // 4. Review dispatch pass.
            if self.team.workflow.review_required {
                self.review_dispatch_pass(&mut busy, &mut reviewing, &mut claimed, &tx)
                    .await?;
            } else {
                self.auto_approve_pass().await?;
            }

            // 5. Recovery probes for agents whose cooldown elapsed.
            self.recovery_probes(&mut busy, &tx);

            // 6. Loop summary.
            self.emit_summary(&busy)?;

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        };

        // Drain remaining work before returning; abort anything that
        // outlives the drain deadline.
        let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        while !busy.is_empty() {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some(done)) => self.on_work_done(&done, &mut busy, &mut reviewing),
                _ => break,
            }
        }
        if !busy.is_empty() {
            tracing::warn!(remaining = busy.len(), "drain deadline expired, aborting work");
            for (_, handle) in busy.drain() {
                handle.abort();
            }
        }

        Ok(result)
    }

    fn on_work_done(
        &self,
        done: &WorkDone,
        busy: &mut HashMap<String, JoinHandle<()>>,
        reviewing: &mut HashSet<String>,
    ) {
        busy.remove(&done.engineer_id);
        if let Some(task_id) = &done.task_id {
            if done.kind == WorkKind::Review {
                reviewing.remove(task_id);
            }
        }
        match &done.crashed {
            Some(reason) => {
                self.health.mark_runtime_crash(&done.engineer_id, reason);
                self.bus.emit(
                    EngineEvent::new(
                        EventKind::AgentError,
                        done.engineer_id.as_str(),
                        "engineer",
                        "Engineer crashed; returned to idle",
                    )
                    .with_detail(reason.clone()),
                );
            }
            None => {
                if done.kind != WorkKind::Probe {
                    self.health.mark_healthy(&done.engineer_id);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    async fn assignment_pass(
        &self,
        tasks: &[Task],
        busy: &mut HashMap<String, JoinHandle<()>>,
        claimed: &mut HashSet<String>,
        tx: &mpsc::Sender<WorkDone>,
    ) -> Result<()> {
        // Backlog tasks plus in-progress tasks nobody is actually working.
        let mut candidates: Vec<&Task> = tasks
            .iter()
            .filter(|t| match t.status {
                TaskStatus::Backlog => true,
                TaskStatus::InProgress => t
                    .assignee
                    .as_ref()
                    .map(|a| !busy.contains_key(a) && !claimed.contains(a))
                    .unwrap_or(true),
                _ => false,
            })
            .collect();
        candidates.sort_by_key(|t| t.priority.rank());

        let mut starved = 0usize;
        for task in candidates {
            if !self.store.are_dependencies_met(task)? {
                continue;
            }

            let preferred = task.assignee.as_deref();
            let Some(engineer) =
                self.select_engineer(preferred, &HashSet::new(), busy, claimed)
            else {
                starved += 1;
                continue;
            };

            // Worktree provisioning failures are absorbed inside
            // start_execution (the task is blocked and an event emitted);
            // anything surfacing here is a store failure and is fatal.
            self.start_execution(task, engineer, busy, claimed, tx)
                .await?;
        }

        if starved > 0 {
            self.bus.emit(EngineEvent::new(
                EventKind::AgentMessage,
                self.team.scrum_master_id(),
                "scrum-master",
                format!("{starved} ready task(s) waiting for an idle engineer"),
            ));
        }
        Ok(())
    }

    async fn start_execution(
        &self,
        task: &Task,
        engineer: Engineer,
        busy: &mut HashMap<String, JoinHandle<()>>,
        claimed: &mut HashSet<String>,
        tx: &mpsc::Sender<WorkDone>,
    ) -> Result<()> {
        // Provision branch and worktree, persisting both before any status
        // move so a task is never observed in progress without them.
        let branch = match &task.branch {
            Some(branch) => branch.clone(),
            None => branch_name_for(task),
        };

        let worktree = match task.worktree.as_ref().filter(|p| p.exists()) {
            Some(path) => path.clone(),
            None => match self.worktrees.create_worktree(&task.id, &branch) {
                Ok(path) => path,
                Err(e) => {
                    self.store
                        .move_task(
                            self.actor(),
                            &task.id,
                            TaskStatus::Blocked,
                            Some(format!("Failed to prepare worktree: {e}")),
                        )
                        .await?;
                    self.bus.emit(
                        EngineEvent::new(
                            EventKind::AgentError,
                            self.team.scrum_master_id(),
                            "scrum-master",
                            format!("Worktree preparation failed for task {}", task.id),
                        )
                        .with_detail(e.to_string())
                        .with_data("taskId", serde_json::json!(task.id)),
                    );
                    return Ok(());
                }
            },
        };

        self.store
            .update_task(
                self.actor(),
                &task.id,
                TaskPatch {
                    branch: Some(Some(branch.clone())),
                    worktree: Some(Some(worktree.clone())),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .assign_task(self.actor(), &task.id, &engineer.spec.id)
            .await?;
        let task = if task.status == TaskStatus::Backlog {
            self.store
                .move_task(self.actor(), &task.id, TaskStatus::InProgress, None)
                .await?
        } else {
            self.store.get_task(&task.id)?
        };

        claimed.insert(engineer.spec.id.clone());

        let engineer_id = engineer.spec.id.clone();
        let store = self.store.clone();
        let worktrees = self.worktrees.clone();
        let context = self.context.clone();
        let bus = self.bus.clone();
        let max_retries = self.team.workflow.max_retries;
        let tx = tx.clone();

        let handle = tokio::spawn(async move {
            let executor = Executor {
                runtime: engineer.runtime.as_ref(),
                agent: &engineer.spec,
                store: &store,
                worktrees: &worktrees,
                context: &context,
                bus: &bus,
                max_retries,
            };
            let crashed = match executor.run(&task).await {
                Ok(_) => None,
                Err(e) => Some(format!("{e:#}")),
            };
            let _ = tx
                .send(WorkDone {
                    engineer_id: engineer.spec.id.clone(),
                    task_id: Some(task.id.clone()),
                    kind: WorkKind::Execute,
                    crashed,
                })
                .await;
        });
        busy.insert(engineer_id, handle);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Review
    // -----------------------------------------------------------------------

    async fn review_dispatch_pass(
        &self,
        busy: &mut HashMap<String, JoinHandle<()>>,
        reviewing: &mut HashSet<String>,
        claimed: &mut HashSet<String>,
        tx: &mpsc::Sender<WorkDone>,
    ) -> Result<()> {
        for task in self.store.get_tasks_by_status(TaskStatus::Review)? {
            if reviewing.contains(&task.id) {
                continue;
            }

            // Never let the author review their own work.
            let mut exclude = HashSet::new();
            if let Some(author) = &task.assignee {
                exclude.insert(author.clone());
            }
            let Some(reviewer) = self.select_engineer(None, &exclude, busy, claimed) else {
                continue;
            };

            reviewing.insert(task.id.clone());
            claimed.insert(reviewer.spec.id.clone());

            let reviewer_id = reviewer.spec.id.clone();
            let store = self.store.clone();
            let worktrees = self.worktrees.clone();
            let context = self.context.clone();
            let bus = self.bus.clone();
            let auto_merge = self.team.workflow.auto_merge;
            let tx = tx.clone();

            let handle = tokio::spawn(async move {
                let role = Reviewer {
                    runtime: reviewer.runtime.as_ref(),
                    agent: &reviewer.spec,
                    store: &store,
                    worktrees: &worktrees,
                    context: &context,
                    bus: &bus,
                    auto_merge,
                };
                let crashed = match role.run(&task).await {
                    Ok(_) => None,
                    Err(e) => Some(format!("{e:#}")),
                };
                let _ = tx
                    .send(WorkDone {
                        engineer_id: reviewer.spec.id.clone(),
                        task_id: Some(task.id.clone()),
                        kind: WorkKind::Review,
                        crashed,
                    })
                    .await;
            });
            busy.insert(reviewer_id, handle);
        }
        Ok(())
    }

    /// With `review_required = false`, approve review tasks directly.
    async fn auto_approve_pass(&self) -> Result<()> {
        for task in self.store.get_tasks_by_status(TaskStatus::Review)? {
            let Some(branch) = task.branch.clone() else {
                continue;
            };

            if self.team.workflow.auto_merge {
                if let Err(e) = self.worktrees.merge_to_main(&branch) {
                    self.store
                        .move_task(
                            self.actor(),
                            &task.id,
                            TaskStatus::Blocked,
                            Some(format!("Auto-approval merge failed: {e}")),
                        )
                        .await?;
                    continue;
                }
                if !task.has_ui_artifact() {
                    let _ = self.worktrees.remove_worktree(&task.id);
                    self.store
                        .update_task(
                            self.actor(),
                            &task.id,
                            TaskPatch {
                                worktree: Some(None),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                self.store
                    .move_task(
                        self.actor(),
                        &task.id,
                        TaskStatus::Done,
                        Some("auto-approved and merged".to_owned()),
                    )
                    .await?;
            } else {
                self.store
                    .move_task(
                        self.actor(),
                        &task.id,
                        TaskStatus::Done,
                        Some("auto-approved; manual merge required".to_owned()),
                    )
                    .await?;
            }

            self.bus.emit(
                EngineEvent::new(
                    EventKind::ReviewApproved,
                    self.team.scrum_master_id(),
                    "scrum-master",
                    format!("Auto-approved task: {}", task.title),
                )
                .with_data("taskId", serde_json::json!(task.id)),
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Engineer selection
    // -----------------------------------------------------------------------

    /// Among idle, unclaimed, schedulable engineers: the preferred id if
    /// eligible, otherwise the first eligible in roster order.
    fn select_engineer(
        &self,
        preferred: Option<&str>,
        exclude: &HashSet<String>,
        busy: &HashMap<String, JoinHandle<()>>,
        claimed: &HashSet<String>,
    ) -> Option<Engineer> {
        let eligible = |e: &&Engineer| {
            !busy.contains_key(&e.spec.id)
                && !claimed.contains(&e.spec.id)
                && !exclude.contains(&e.spec.id)
                && self.health.is_schedulable(&e.spec.id)
        };

        if let Some(preferred) = preferred {
            if let Some(engineer) = self
                .engineers
                .iter()
                .filter(eligible)
                .find(|e| e.spec.id == preferred)
            {
                return Some(engineer.clone());
            }
        }
        self.engineers.iter().find(eligible).cloned()
    }

    // -----------------------------------------------------------------------
    // Health probes
    // -----------------------------------------------------------------------

    /// Probe every engineer once before the first tick.
    async fn preflight_probes(&self) {
        for engineer in &self.engineers {
            self.health.mark_pending_probe(&engineer.spec.id);
            probe_engineer(engineer, &self.health, &self.bus).await;
        }
    }

    /// Dispatch recovery probes for agents whose cooldown elapsed. Each
    /// probe occupies the engineer like any other work.
    fn recovery_probes(
        &self,
        busy: &mut HashMap<String, JoinHandle<()>>,
        tx: &mpsc::Sender<WorkDone>,
    ) {
        for engineer in &self.engineers {
            if busy.contains_key(&engineer.spec.id) || !self.health.should_probe(&engineer.spec.id)
            {
                continue;
            }
            self.health.mark_pending_probe(&engineer.spec.id);

            let engineer = engineer.clone();
            let health = Arc::clone(&self.health);
            let bus = self.bus.clone();
            let tx = tx.clone();
            let engineer_id = engineer.spec.id.clone();

            let handle = tokio::spawn(async move {
                probe_engineer(&engineer, &health, &bus).await;
                let _ = tx
                    .send(WorkDone {
                        engineer_id: engineer.spec.id.clone(),
                        task_id: None,
                        kind: WorkKind::Probe,
                        crashed: None,
                    })
                    .await;
            });
            busy.insert(engineer_id, handle);
        }
    }

    fn emit_summary(&self, busy: &HashMap<String, JoinHandle<()>>) -> Result<()> {
        let tasks = self.store.get_all_tasks()?;
        let done = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count();
        let idle = self
            .engineers
            .iter()
            .filter(|e| !busy.contains_key(&e.spec.id))
            .count();
        self.bus.emit(EngineEvent::new(
            EventKind::AgentMessage,
            self.team.scrum_master_id(),
            "scrum-master",
            format!(
                "Sprint loop: {done}/{} done, {idle} idle, {} active",
                tasks.len(),
                busy.len()
            ),
        ));
        Ok(())
    }
}

/// Run the fixed health probe against one engineer and record the result.
async fn probe_engineer(engineer: &Engineer, health: &HealthRegistry, bus: &EventBus) {
    let id = engineer.spec.id.as_str();
    let options = RunOptions::default();

    let stream = match engineer.runtime.run(PROBE_PROMPT, &options).await {
        Ok(stream) => stream,
        Err(e) => {
            health.mark_probe_failure(id, &format!("probe spawn failed: {e:#}"));
            return;
        }
    };

    match consume_stream(stream, WatchdogLimits::probe(), |_| {}).await {
        Ok(messages) => {
            let transcript: String = messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let lower = transcript.to_lowercase();
            let has_error = messages.iter().any(|m| m.kind == MessageKind::Error);
            let unhealthy = has_error
                || has_nonzero_exit(&lower)
                || UNHEALTHY_PATTERNS.iter().any(|p| lower.contains(p));
            if unhealthy {
                health.mark_probe_failure(id, "probe transcript matched unhealthy pattern");
            } else {
                health.mark_healthy(id);
                tracing::debug!(agent = id, "health probe passed");
            }
        }
        Err(timeout) => {
            engineer.runtime.abort().await;
            health.mark_probe_failure(id, &format!("probe {timeout}"));
            bus.emit(
                EngineEvent::new(
                    EventKind::AgentError,
                    id,
                    "engineer",
                    "Health probe timed out",
                )
                .with_detail(timeout.to_string()),
            );
        }
    }
}

/// Conventional branch name for a task: `task/<id>[-<slug>]`.
pub fn branch_name_for(task: &Task) -> String {
    let slug = slugify(&task.title);
    if slug.is_empty() {
        format!("task/{}", task.id)
    } else {
        format!("task/{}-{slug}", task.id)
    }
}

/// Lowercase, hyphen-collapse, and truncate a title for branch names.
fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_hyphen = true;
    for c in title.chars() {
        if slug.chars().count() >= SLUG_MAX_CHARS {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    slug.trim_end_matches('-').to_owned()
}

/// The stuck set: blocked tasks plus backlog tasks whose dependency chain
/// passes through one.
fn compute_stuck(tasks: &[Task]) -> HashSet<String> {
    let mut stuck: HashSet<String> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .map(|t| t.id.clone())
        .collect();

    loop {
        let mut grew = false;
        for task in tasks {
            if task.status == TaskStatus::Backlog
                && !stuck.contains(&task.id)
                && task.depends_on.iter().any(|dep| stuck.contains(dep))
            {
                stuck.insert(task.id.clone());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    stuck
}
