//! A reviewer approval whose merge conflicts must block the task with an
//! unrecoverable reason, and the failure pipeline must never retry it.

mod common;

use common::ScriptedRuntime;
use tempfile::TempDir;

use arkaledge_core::context::ProjectContext;
use arkaledge_core::failure::{FailureAction, FailureHandler};
use arkaledge_core::roles::{ReviewOutcome, Reviewer};
use arkaledge_core::worktree::WorktreeManager;
use arkaledge_core::{AgentRole, AgentSpec, TeamConfig, WorkflowConfig};
use arkaledge_events::{EventBus, EventKind};
use arkaledge_store::{Actor, KanbanStore, NewTask, TaskPatch, TaskPriority, TaskStatus};
use arkaledge_test_utils::run_git;

const SM: Actor<'_> = Actor {
    id: "sm",
    role: "scrum-master",
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_merge_blocks_task_permanently() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().to_path_buf();
    let bus = EventBus::new();
    let mut rx = bus.subscribe();

    let store = KanbanStore::new(&project, bus.clone());
    store.init().await.unwrap();
    let worktrees = WorktreeManager::new(&project);

    // A task whose branch will conflict with main.
    let task = store
        .add_task(
            SM,
            NewTask {
                title: "Conflicting change".into(),
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

    let branch = format!("task/{}-conflicting-change", task.id);
    let worktree = worktrees.create_worktree(&task.id, &branch).unwrap();
    std::fs::write(worktree.join("shared.txt"), "branch version\n").unwrap();
    worktrees.commit_all(&worktree, "branch change").unwrap();

    // A different version of the same new file lands on main.
    std::fs::write(project.join("shared.txt"), "main version\n").unwrap();
    run_git(&project, &["add", "shared.txt"]);
    run_git(&project, &["commit", "-m", "main change"]);

    store.assign_task(SM, &task.id, "eng-1").await.unwrap();
    store
        .update_task(
            SM,
            &task.id,
            TaskPatch {
                branch: Some(Some(branch.clone())),
                worktree: Some(Some(worktree.clone())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .move_task(SM, &task.id, TaskStatus::InProgress, None)
        .await
        .unwrap();
    let task = store
        .move_task(SM, &task.id, TaskStatus::Review, None)
        .await
        .unwrap();

    // The reviewer approves; the merge cannot land.
    let runtime = ScriptedRuntime::new();
    let reviewer_spec = AgentSpec {
        id: "eng-2".into(),
        role: AgentRole::Engineer,
        backend: "scripted".into(),
        model: "test".into(),
        tools: vec![],
    };
    let context = ProjectContext::load_or_build(&project).unwrap();
    let reviewer = Reviewer {
        runtime: &runtime,
        agent: &reviewer_spec,
        store: &store,
        worktrees: &worktrees,
        context: &context,
        bus: &bus,
        auto_merge: true,
    };

    let outcome = reviewer.run(&task).await.unwrap();
    assert_eq!(outcome, ReviewOutcome::Blocked);

    let task = store.get_task(&task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    let reason = task
        .last_status_change()
        .unwrap()
        .detail
        .clone()
        .unwrap();
    assert!(reason.contains("Merge/cleanup failed"), "reason: {reason}");

    // The merge was aborted: no unmerged entries remain in the index.
    let status = arkaledge_test_utils::git_stdout(&project, &["status", "--porcelain"]);
    assert!(
        !status.lines().any(|l| l.starts_with("UU") || l.starts_with("AA")),
        "status: {status}"
    );

    // The failure pipeline classifies the reason as unrecoverable: no
    // retry, no reassignment, exactly one permanent-block announcement
    // over any number of sweeps.
    let team = TeamConfig {
        agents: vec![
            AgentSpec {
                id: "eng-1".into(),
                role: AgentRole::Engineer,
                backend: "claude-code".into(),
                model: "sonnet".into(),
                tools: vec![],
            },
            AgentSpec {
                id: "eng-2".into(),
                role: AgentRole::Engineer,
                backend: "codex".into(),
                model: "gpt".into(),
                tools: vec![],
            },
        ],
        workflow: WorkflowConfig::default(),
    };
    let handler = FailureHandler::new(store.clone(), bus.clone(), team);
    for _ in 0..3 {
        let action = handler.handle_blocked(&task).await.unwrap();
        assert_eq!(action, FailureAction::Blocked);
    }

    let task = store.get_task(&task.id).unwrap();
    assert_eq!(task.retry_count, 0, "no retry consumed");
    assert_eq!(task.status, TaskStatus::Blocked);

    let mut permanent = 0;
    while let Ok(event) = rx.try_recv() {
        if event.kind == EventKind::AgentError && event.summary.contains("permanently blocked") {
            permanent += 1;
        }
    }
    assert_eq!(permanent, 1);
}
