//! End-to-end orchestration scenarios with scripted backends and real git
//! repositories.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedRuntime, Step};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use arkaledge_core::context::ProjectContext;
use arkaledge_core::failure::FailureHandler;
use arkaledge_core::health::HealthRegistry;
use arkaledge_core::runtime::AgentRuntime;
use arkaledge_core::scheduler::{Engineer, Scheduler};
use arkaledge_core::worktree::WorktreeManager;
use arkaledge_core::{
    AgentRole, AgentSpec, EngineOptions, Orchestrator, ScheduleResult, SchedulerConfig,
    TeamConfig, WorkflowConfig,
};
use arkaledge_events::{EngineEvent, EventBus, EventKind};
use arkaledge_store::{Actor, KanbanStore, NewTask, TaskPatch, TaskPriority, TaskStatus};
use arkaledge_test_utils::git_stdout;

const PLAN_ONE: &str = r#"[
  {"title": "Add greeting module", "description": "Implement a greeting", "acceptanceCriteria": ["greets"], "priority": "high"}
]"#;

const PLAN_TWO_DEP: &str = r#"[
  {"title": "Create schema", "description": "d1", "acceptanceCriteria": [], "priority": "high"},
  {"title": "Add endpoint", "description": "d2", "acceptanceCriteria": [], "priority": "medium", "dependsOn": [0]}
]"#;

fn agent(id: &str, role: AgentRole) -> AgentSpec {
    AgentSpec {
        id: id.into(),
        role,
        backend: "scripted".into(),
        model: "test".into(),
        tools: vec![],
    }
}

fn team(engineers: usize, workflow: WorkflowConfig) -> TeamConfig {
    let mut agents = vec![agent("pm-1", AgentRole::ProductManager)];
    for i in 1..=engineers {
        agents.push(agent(&format!("eng-{i}"), AgentRole::Engineer));
    }
    TeamConfig { agents, workflow }
}

fn options() -> EngineOptions {
    EngineOptions {
        resume: false,
        http_port: None,
        scheduler: SchedulerConfig {
            poll_interval: Duration::from_millis(100),
        },
    }
}

struct Harness {
    _dir: TempDir,
    project: std::path::PathBuf,
    bus: EventBus,
    runtimes: HashMap<String, Arc<dyn AgentRuntime>>,
    scripted: HashMap<String, Arc<ScriptedRuntime>>,
}

impl Harness {
    fn new(team: &TeamConfig, scripts: Vec<(&str, ScriptedRuntime)>) -> Self {
        let dir = TempDir::new().unwrap();
        let project = dir.path().to_path_buf();

        let mut scripted: HashMap<String, Arc<ScriptedRuntime>> = HashMap::new();
        for (id, runtime) in scripts {
            scripted.insert(id.to_owned(), Arc::new(runtime));
        }
        // Agents without explicit scripts get an all-defaults runtime.
        for agent in &team.agents {
            scripted
                .entry(agent.id.clone())
                .or_insert_with(|| Arc::new(ScriptedRuntime::new()));
        }

        let runtimes: HashMap<String, Arc<dyn AgentRuntime>> = scripted
            .iter()
            .map(|(id, rt)| (id.clone(), Arc::clone(rt) as Arc<dyn AgentRuntime>))
            .collect();

        Self {
            _dir: dir,
            project,
            bus: EventBus::with_capacity(4096),
            runtimes,
            scripted,
        }
    }

    fn runtime(&self, id: &str) -> &Arc<ScriptedRuntime> {
        &self.scripted[id]
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn position(events: &[EngineEvent], predicate: impl Fn(&EngineEvent) -> bool) -> usize {
    events
        .iter()
        .position(predicate)
        .unwrap_or_else(|| panic!("expected event not found"))
}

fn status_change_to(event: &EngineEvent, to: &str) -> bool {
    event.kind == EventKind::TaskStatusChanged
        && event
            .data
            .as_ref()
            .and_then(|d| d.get("to"))
            .and_then(|v| v.as_str())
            == Some(to)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_single_task() {
    let team = team(2, WorkflowConfig::default());
    let harness = Harness::new(
        &team,
        vec![("pm-1", ScriptedRuntime::new().with_plan(PLAN_ONE))],
    );
    let mut rx = harness.bus.subscribe();

    let orchestrator = Orchestrator::new(
        team,
        harness.runtimes.clone(),
        &harness.project,
        options(),
        harness.bus.clone(),
    );
    let outcome = orchestrator.run("Build a greeting feature").await.unwrap();

    assert_eq!(outcome.schedule, ScheduleResult::Completed);
    assert_eq!(outcome.tasks.len(), 1);
    let task = &outcome.tasks[0];
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.retry_count, 0);
    assert!(task.worktree.is_none(), "worktree cleared after merge");
    let branch = task.branch.as_deref().unwrap();
    assert!(branch.starts_with("task/"));

    // The branch was merged into main with a merge commit.
    let log = git_stdout(&harness.project, &["log", "--oneline", "main"]);
    assert!(log.contains(&format!("Merge {branch}")), "log: {log}");

    // Event ordering along the documented happy path.
    let events = drain(&mut rx);
    let started = position(&events, |e| e.kind == EventKind::ProjectStarted);
    let created = position(&events, |e| e.kind == EventKind::TaskCreated);
    let assigned = position(&events, |e| e.kind == EventKind::TaskAssigned);
    let in_progress = position(&events, |e| status_change_to(e, "in_progress"));
    let completed = position(&events, |e| {
        e.kind == EventKind::AgentCompleted && e.agent_role == "engineer"
    });
    let review = position(&events, |e| status_change_to(e, "review"));
    let review_started = position(&events, |e| e.kind == EventKind::ReviewStarted);
    let approved = position(&events, |e| e.kind == EventKind::ReviewApproved);
    let done = position(&events, |e| status_change_to(e, "done"));
    let finished = position(&events, |e| e.kind == EventKind::ProjectCompleted);

    assert!(started < created);
    assert!(created < assigned);
    assert!(assigned < in_progress);
    assert!(in_progress < completed);
    assert!(completed < review);
    assert!(review < review_started);
    assert!(review_started < approved);
    assert!(approved < done);
    assert!(done < finished);

    // Reviewer diversity: the reviewer is never the author.
    let review_event = &events[review_started];
    assert_ne!(Some(review_event.agent_id.as_str()), task.assignee.as_deref());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependent_task_waits_for_dependency() {
    let team = team(2, WorkflowConfig::default());
    let harness = Harness::new(
        &team,
        vec![("pm-1", ScriptedRuntime::new().with_plan(PLAN_TWO_DEP))],
    );
    let mut rx = harness.bus.subscribe();

    let orchestrator = Orchestrator::new(
        team,
        harness.runtimes.clone(),
        &harness.project,
        options(),
        harness.bus.clone(),
    );
    let outcome = orchestrator.run("Two step feature").await.unwrap();

    assert_eq!(outcome.schedule, ScheduleResult::Completed);
    assert_eq!(outcome.tasks.len(), 2);
    assert!(outcome.tasks.iter().all(|t| t.status == TaskStatus::Done));

    let events = drain(&mut rx);
    // Creation order matches plan order.
    let created: Vec<&EngineEvent> = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskCreated)
        .collect();
    assert_eq!(created.len(), 2);
    let t1_id = created[0].data.as_ref().unwrap()["taskId"]
        .as_str()
        .unwrap()
        .to_owned();
    let t2_id = created[1].data.as_ref().unwrap()["taskId"]
        .as_str()
        .unwrap()
        .to_owned();

    let task_of = |e: &EngineEvent| {
        e.data
            .as_ref()
            .and_then(|d| d.get("taskId"))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
    };

    let t1_done = position(&events, |e| {
        status_change_to(e, "done") && task_of(e) == Some(t1_id.clone())
    });
    let t2_assigned = position(&events, |e| {
        e.kind == EventKind::TaskAssigned && task_of(e) == Some(t2_id.clone())
    });
    assert!(
        t1_done < t2_assigned,
        "dependent task must not be assigned before its dependency is done"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn executor_retries_then_succeeds() {
    let team = team(2, WorkflowConfig::default());
    let harness = Harness::new(
        &team,
        vec![
            ("pm-1", ScriptedRuntime::new().with_plan(PLAN_ONE)),
            (
                "eng-1",
                ScriptedRuntime::new().with_work(vec![
                    Step::failing_tests(),
                    Step::failing_tests(),
                    Step::text("all tests green now"),
                ]),
            ),
        ],
    );

    let orchestrator = Orchestrator::new(
        team,
        harness.runtimes.clone(),
        &harness.project,
        options(),
        harness.bus.clone(),
    );
    let outcome = orchestrator.run("Flaky start").await.unwrap();

    assert_eq!(outcome.schedule, ScheduleResult::Completed);
    let task = &outcome.tasks[0];
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.retry_count, 2, "two self-correction retries consumed");
    assert_eq!(harness.runtime("eng-1").work_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn always_failing_task_blocks_and_strands_dependents() {
    let workflow = WorkflowConfig {
        max_retries: 0,
        ..Default::default()
    };
    // A single engineer: no alternate backend to reassign to.
    let team = team(1, workflow);
    let harness = Harness::new(
        &team,
        vec![
            ("pm-1", ScriptedRuntime::new().with_plan(PLAN_TWO_DEP)),
            (
                "eng-1",
                ScriptedRuntime::new().with_work(vec![
                    Step::failing_tests(),
                    Step::failing_tests(),
                    Step::failing_tests(),
                ]),
            ),
        ],
    );
    let mut rx = harness.bus.subscribe();

    let orchestrator = Orchestrator::new(
        team,
        harness.runtimes.clone(),
        &harness.project,
        options(),
        harness.bus.clone(),
    );
    let outcome = orchestrator.run("Doomed feature").await.unwrap();

    let ScheduleResult::Stalled { stuck_tasks } = outcome.schedule else {
        panic!("expected a stalled board, got {:?}", outcome.schedule);
    };
    assert_eq!(stuck_tasks.len(), 2, "blocked task plus its dependent");

    let blocked: Vec<_> = outcome
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .collect();
    assert_eq!(blocked.len(), 1);
    let backlog: Vec<_> = outcome
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Backlog)
        .collect();
    assert_eq!(backlog.len(), 1, "dependent never leaves backlog");

    // The permanent-block announcement fires exactly once despite repeated
    // sweeps.
    let events = drain(&mut rx);
    let permanent: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::AgentError && e.summary.contains("permanently blocked"))
        .collect();
    assert_eq!(permanent.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejection_sends_task_back_with_comments() {
    let team = team(2, WorkflowConfig::default());
    let harness = Harness::new(
        &team,
        vec![
            ("pm-1", ScriptedRuntime::new().with_plan(PLAN_ONE)),
            (
                "eng-2",
                ScriptedRuntime::new()
                    .with_review(vec![Step::reject("needs a unit test"), Step::approve()]),
            ),
        ],
    );
    let mut rx = harness.bus.subscribe();

    let orchestrator = Orchestrator::new(
        team,
        harness.runtimes.clone(),
        &harness.project,
        options(),
        harness.bus.clone(),
    );
    let outcome = orchestrator.run("Reviewed feature").await.unwrap();

    assert_eq!(outcome.schedule, ScheduleResult::Completed);
    let task = &outcome.tasks[0];
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task
        .review_comments
        .iter()
        .any(|c| c.contains("needs a unit test")));
    assert!(
        harness.runtime("eng-1").work_calls.load(Ordering::SeqCst) >= 2,
        "the author reworked the task after rejection"
    );

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| e.kind == EventKind::ReviewRejected));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_approval_without_reviewers() {
    let workflow = WorkflowConfig {
        review_required: false,
        ..Default::default()
    };
    let team = team(1, workflow);
    let harness = Harness::new(
        &team,
        vec![("pm-1", ScriptedRuntime::new().with_plan(PLAN_ONE))],
    );
    let mut rx = harness.bus.subscribe();

    let orchestrator = Orchestrator::new(
        team,
        harness.runtimes.clone(),
        &harness.project,
        options(),
        harness.bus.clone(),
    );
    let outcome = orchestrator.run("Solo feature").await.unwrap();

    assert_eq!(outcome.schedule, ScheduleResult::Completed);
    assert_eq!(outcome.tasks[0].status, TaskStatus::Done);
    assert_eq!(
        harness.runtime("eng-1").review_calls.load(Ordering::SeqCst),
        0,
        "no reviewer backend is ever invoked"
    );

    let events = drain(&mut rx);
    assert!(
        events.iter().any(|e| e.kind == EventKind::ReviewApproved
            && e.agent_role == "scrum-master"),
        "auto-approval is attributed to the scrum master"
    );
    assert!(!events.iter().any(|e| e.kind == EventKind::ReviewStarted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_skips_planner_and_finishes_the_board() {
    let team = team(2, WorkflowConfig::default());
    let harness = Harness::new(
        &team,
        vec![("pm-1", ScriptedRuntime::new().with_plan(PLAN_ONE))],
    );

    // Pre-populate the board as a killed run would have left it: one task
    // done, one in progress with stale worktree metadata.
    let store = KanbanStore::new(&harness.project, harness.bus.clone());
    store.init().await.unwrap();
    let sm = Actor {
        id: "sm",
        role: "scrum-master",
    };
    let new_task = |title: &str| NewTask {
        title: title.into(),
        description: "d".into(),
        acceptance_criteria: vec![],
        priority: TaskPriority::Medium,
        epic: None,
        depends_on: vec![],
        context_fingerprint: None,
    };

    let done_task = store.add_task(sm, new_task("Finished earlier")).await.unwrap();
    store
        .move_task(sm, &done_task.id, TaskStatus::InProgress, None)
        .await
        .unwrap();
    store
        .move_task(sm, &done_task.id, TaskStatus::Review, None)
        .await
        .unwrap();
    store
        .move_task(sm, &done_task.id, TaskStatus::Done, None)
        .await
        .unwrap();

    let half_done = store.add_task(sm, new_task("Interrupted work")).await.unwrap();
    store
        .update_task(
            sm,
            &half_done.id,
            TaskPatch {
                branch: Some(Some(format!("task/{}-interrupted-work", half_done.id))),
                worktree: Some(Some(harness.project.join(".arkaledge/worktrees/gone"))),
                assignee: Some(Some("eng-1".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .move_task(sm, &half_done.id, TaskStatus::InProgress, None)
        .await
        .unwrap();

    let mut opts = options();
    opts.resume = true;
    let orchestrator = Orchestrator::new(
        team,
        harness.runtimes.clone(),
        &harness.project,
        opts,
        harness.bus.clone(),
    );
    let outcome = orchestrator.run("").await.unwrap();

    assert_eq!(outcome.schedule, ScheduleResult::Completed);
    assert!(outcome.tasks.iter().all(|t| t.status == TaskStatus::Done));
    assert_eq!(
        harness.runtime("pm-1").plan_calls.load(Ordering::SeqCst),
        0,
        "resume must not invoke the planner"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worktree_failure_blocks_backlog_task() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().to_path_buf();
    let bus = EventBus::with_capacity(4096);
    let mut rx = bus.subscribe();

    let store = KanbanStore::new(&project, bus.clone());
    store.init().await.unwrap();
    let task = store
        .add_task(
            Actor {
                id: "pm-1",
                role: "product-manager",
            },
            NewTask {
                title: "Doomed worktree".into(),
                description: "d".into(),
                acceptance_criteria: vec![],
                priority: TaskPriority::High,
                epic: None,
                depends_on: vec![],
                context_fingerprint: None,
            },
        )
        .await
        .unwrap();

    // Occupy the task's worktree path with a plain file so `git worktree
    // add` cannot create the directory there.
    let worktrees = WorktreeManager::new(&project);
    std::fs::create_dir_all(worktrees.worktree_base()).unwrap();
    std::fs::write(worktrees.worktree_path(&task.id), "in the way").unwrap();

    // A single engineer and no retry budget: the provisioning failure must
    // flow straight through the pipeline to a permanent block.
    let workflow = WorkflowConfig {
        max_retries: 0,
        ..Default::default()
    };
    let team = TeamConfig {
        agents: vec![agent("eng-1", AgentRole::Engineer)],
        workflow,
    };
    let engineer = Engineer {
        spec: team.agents[0].clone(),
        runtime: Arc::new(ScriptedRuntime::new()),
    };

    let scheduler = Scheduler {
        store: store.clone(),
        worktrees,
        bus: bus.clone(),
        context: ProjectContext::load_or_build(&project).unwrap(),
        team: team.clone(),
        engineers: vec![engineer],
        health: Arc::new(HealthRegistry::new()),
        failure: Arc::new(FailureHandler::new(store.clone(), bus.clone(), team)),
        config: SchedulerConfig {
            poll_interval: Duration::from_millis(100),
        },
        cancel: CancellationToken::new(),
    };

    let result = scheduler.run().await.unwrap();
    let ScheduleResult::Stalled { stuck_tasks } = result else {
        panic!("expected a stalled board, got {result:?}");
    };
    assert_eq!(stuck_tasks, vec![task.id.clone()]);

    let task = store.get_task(&task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(task.assignee.is_none(), "blocked before assignment");
    let reason = task
        .last_status_change()
        .unwrap()
        .detail
        .clone()
        .unwrap();
    assert!(
        reason.contains("Failed to prepare worktree:"),
        "reason: {reason}"
    );

    let events = drain(&mut rx);
    assert!(
        events.iter().any(|e| e.kind == EventKind::AgentError
            && e.summary.contains("Worktree preparation failed")),
        "provisioning failure must be surfaced on the bus"
    );
    let permanent = events
        .iter()
        .filter(|e| {
            e.kind == EventKind::AgentError && e.summary.contains("permanently blocked")
        })
        .count();
    assert_eq!(permanent, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_run_refuses_populated_board() {
    let team = team(2, WorkflowConfig::default());
    let harness = Harness::new(&team, vec![]);

    let store = KanbanStore::new(&harness.project, harness.bus.clone());
    store.init().await.unwrap();
    store
        .add_task(
            Actor {
                id: "sm",
                role: "scrum-master",
            },
            NewTask {
                title: "left over".into(),
                description: "d".into(),
                acceptance_criteria: vec![],
                priority: TaskPriority::Low,
                epic: None,
                depends_on: vec![],
                context_fingerprint: None,
            },
        )
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(
        team,
        harness.runtimes.clone(),
        &harness.project,
        options(),
        harness.bus.clone(),
    );
    let err = orchestrator.run("spec").await.unwrap_err();
    assert!(err.to_string().contains("resume"), "got: {err}");
}
