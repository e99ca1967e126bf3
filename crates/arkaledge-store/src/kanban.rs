//! The kanban store: single source of truth for task state.
//!
//! Every mutation is a read-modify-write cycle on the persisted JSON
//! document, performed under the advisory file lock from [`crate::lock`].
//! Reads are unlocked snapshots. Events are emitted after the lock is
//! released so no subscriber work happens inside the critical section.

use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use arkaledge_events::{EngineEvent, EventBus, EventKind};

use crate::lock::{FileLock, LockError};
use crate::models::{
    Artifact, HistoryAction, KanbanState, Task, TaskHistoryEvent, TaskPriority, TaskStatus,
};

/// Directory under the project root that holds all engine state.
pub const STATE_DIR: &str = ".arkaledge";

/// File name of the persisted board inside [`STATE_DIR`].
pub const STATE_FILE: &str = "kanban.json";

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum KanbanError {
    /// Lock acquisition failed after the retry budget.
    #[error("kanban locking failed")]
    Locking(#[from] LockError),

    /// The state file exists but is not valid JSON for [`KanbanState`].
    #[error("kanban state corrupt at {path}")]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// No task with the given id.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The requested status change is not an edge of the task state machine.
    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Filesystem error reading or writing the state file.
    #[error("kanban I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The identity performing a mutation, recorded in history and events.
#[derive(Debug, Clone, Copy)]
pub struct Actor<'a> {
    pub id: &'a str,
    pub role: &'a str,
}

/// Input for [`KanbanStore::add_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: TaskPriority,
    pub epic: Option<String>,
    pub depends_on: Vec<String>,
    pub context_fingerprint: Option<String>,
}

/// Partial update for [`KanbanStore::update_task`]. `None` leaves a field
/// untouched; for clearable fields the inner `Option` distinguishes
/// "set to value" from "clear".
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub priority: Option<TaskPriority>,
    pub epic: Option<String>,
    pub assignee: Option<Option<String>>,
    pub branch: Option<Option<String>>,
    pub worktree: Option<Option<PathBuf>>,
    pub retry_count: Option<u32>,
    pub depends_on: Option<Vec<String>>,
    pub context_fingerprint: Option<String>,
    pub artifacts: Option<Vec<Artifact>>,
}

impl TaskPatch {
    /// Names of the fields this patch touches, for the audit entry.
    fn changed_keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.title.is_some() {
            keys.push("title");
        }
        if self.description.is_some() {
            keys.push("description");
        }
        if self.acceptance_criteria.is_some() {
            keys.push("acceptanceCriteria");
        }
        if self.priority.is_some() {
            keys.push("priority");
        }
        if self.epic.is_some() {
            keys.push("epic");
        }
        if self.assignee.is_some() {
            keys.push("assignee");
        }
        if self.branch.is_some() {
            keys.push("branch");
        }
        if self.worktree.is_some() {
            keys.push("worktree");
        }
        if self.retry_count.is_some() {
            keys.push("retryCount");
        }
        if self.depends_on.is_some() {
            keys.push("dependsOn");
        }
        if self.context_fingerprint.is_some() {
            keys.push("contextFingerprint");
        }
        if self.artifacts.is_some() {
            keys.push("artifacts");
        }
        keys
    }

    fn apply(self, task: &mut Task) {
        if let Some(v) = self.title {
            task.title = v;
        }
        if let Some(v) = self.description {
            task.description = v;
        }
        if let Some(v) = self.acceptance_criteria {
            task.acceptance_criteria = v;
        }
        if let Some(v) = self.priority {
            task.priority = v;
        }
        if let Some(v) = self.epic {
            task.epic = Some(v);
        }
        if let Some(v) = self.assignee {
            task.assignee = v;
        }
        if let Some(v) = self.branch {
            task.branch = v;
        }
        if let Some(v) = self.worktree {
            task.worktree = v;
        }
        if let Some(v) = self.retry_count {
            task.retry_count = v;
        }
        if let Some(v) = self.depends_on {
            task.depends_on = v;
        }
        if let Some(v) = self.context_fingerprint {
            task.context_fingerprint = Some(v);
        }
        if let Some(v) = self.artifacts {
            task.artifacts = v;
        }
    }
}

/// Handle to the persisted board of one project directory.
#[derive(Debug, Clone)]
pub struct KanbanStore {
    project_dir: PathBuf,
    bus: EventBus,
}

impl KanbanStore {
    pub fn new(project_dir: impl Into<PathBuf>, bus: EventBus) -> Self {
        Self {
            project_dir: project_dir.into(),
            bus,
        }
    }

    /// Path of the `.arkaledge` state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(STATE_DIR)
    }

    /// Path of the persisted board document.
    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir().join(format!("{STATE_FILE}.lock"))
    }

    /// Whether a board document already exists on disk.
    pub fn state_exists(&self) -> bool {
        self.state_path().exists()
    }

    /// Ensure the state directory and board document exist.
    ///
    /// On first creation the board gets an empty task list and a freshly
    /// generated project id.
    pub async fn init(&self) -> Result<KanbanState, KanbanError> {
        let _lock = FileLock::acquire(&self.lock_path()).await?;
        let path = self.state_path();
        if !path.exists() {
            let fresh = KanbanState {
                project_id: Uuid::new_v4().to_string(),
                tasks: Vec::new(),
                last_updated: chrono::Utc::now(),
            };
            self.save(&fresh)?;
            tracing::info!(project_id = %fresh.project_id, path = %path.display(), "initialized kanban state");
            return Ok(fresh);
        }
        self.load()
    }

    /// Unlocked snapshot of the full board.
    pub fn load(&self) -> Result<KanbanState, KanbanError> {
        let path = self.state_path();
        let content = std::fs::read_to_string(&path).map_err(|source| KanbanError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| KanbanError::StateCorrupt { path, source })
    }

    fn save(&self, state: &KanbanState) -> Result<(), KanbanError> {
        let path = self.state_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| KanbanError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|source| KanbanError::StateCorrupt {
                path: path.clone(),
                source,
            })?;
        std::fs::write(&path, json).map_err(|source| KanbanError::Io { path, source })
    }

    /// Run one locked read-modify-write cycle.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut KanbanState) -> Result<T, KanbanError>,
    ) -> Result<T, KanbanError> {
        let _lock = FileLock::acquire(&self.lock_path()).await?;
        let mut state = self.load()?;
        let out = f(&mut state)?;
        state.last_updated = chrono::Utc::now();
        self.save(&state)?;
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// All tasks in insertion order.
    pub fn get_all_tasks(&self) -> Result<Vec<Task>, KanbanError> {
        Ok(self.load()?.tasks)
    }

    /// Tasks currently in the given column.
    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, KanbanError> {
        Ok(self
            .load()?
            .tasks
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    /// Look up one task by id.
    pub fn get_task(&self, id: &str) -> Result<Task, KanbanError> {
        self.load()?
            .task(id)
            .cloned()
            .ok_or_else(|| KanbanError::NotFound(id.to_owned()))
    }

    /// Whether every dependency of `task` is currently `done`.
    ///
    /// A dependency id that no longer resolves counts as unmet.
    pub fn are_dependencies_met(&self, task: &Task) -> Result<bool, KanbanError> {
        if task.depends_on.is_empty() {
            return Ok(true);
        }
        let state = self.load()?;
        Ok(task.depends_on.iter().all(|dep| {
            state
                .task(dep)
                .map(|t| t.status == TaskStatus::Done)
                .unwrap_or(false)
        }))
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Append a new task in `backlog` and emit `task:created`.
    pub async fn add_task(&self, actor: Actor<'_>, input: NewTask) -> Result<Task, KanbanError> {
        let id = short_id();
        let task = Task {
            id: id.clone(),
            title: input.title,
            description: input.description,
            acceptance_criteria: input.acceptance_criteria,
            status: TaskStatus::Backlog,
            priority: input.priority,
            epic: input.epic,
            assignee: None,
            branch: None,
            worktree: None,
            retry_count: 0,
            created_by: actor.id.to_owned(),
            review_comments: Vec::new(),
            depends_on: input.depends_on,
            context_fingerprint: input.context_fingerprint,
            artifacts: Vec::new(),
            history: vec![TaskHistoryEvent::now(actor.id, HistoryAction::Created, None)],
        };

        let stored = task.clone();
        self.mutate(move |state| {
            state.tasks.push(task);
            Ok(())
        })
        .await?;

        self.bus.emit(
            EngineEvent::new(
                EventKind::TaskCreated,
                actor.id,
                actor.role,
                format!("Created task: {}", stored.title),
            )
            .with_data("taskId", serde_json::json!(stored.id)),
        );

        Ok(stored)
    }

    /// Merge partial fields into a task and record an `updated` entry
    /// naming the changed keys.
    pub async fn update_task(
        &self,
        actor: Actor<'_>,
        id: &str,
        patch: TaskPatch,
    ) -> Result<Task, KanbanError> {
        let changed = patch.changed_keys().join(", ");
        let actor_id = actor.id.to_owned();
        let task_id = id.to_owned();
        self.mutate(move |state| {
            let task = state
                .task_mut(&task_id)
                .ok_or(KanbanError::NotFound(task_id.clone()))?;
            patch.apply(task);
            task.history.push(TaskHistoryEvent::now(
                actor_id,
                HistoryAction::Updated,
                Some(format!("changed: {changed}")),
            ));
            Ok(task.clone())
        })
        .await
    }

    /// Set the assignee and emit `task:assigned`.
    pub async fn assign_task(
        &self,
        actor: Actor<'_>,
        id: &str,
        agent_id: &str,
    ) -> Result<Task, KanbanError> {
        let actor_id = actor.id.to_owned();
        let assignee = agent_id.to_owned();
        let task_id = id.to_owned();
        let task = self
            .mutate(move |state| {
                let task = state
                    .task_mut(&task_id)
                    .ok_or(KanbanError::NotFound(task_id.clone()))?;
                task.assignee = Some(assignee.clone());
                task.history.push(TaskHistoryEvent::now(
                    actor_id,
                    HistoryAction::Assigned,
                    Some(format!("assigned to {assignee}")),
                ));
                Ok(task.clone())
            })
            .await?;

        self.bus.emit(
            EngineEvent::new(
                EventKind::TaskAssigned,
                actor.id,
                actor.role,
                format!("Assigned task {} to {agent_id}", task.id),
            )
            .with_data("taskId", serde_json::json!(task.id))
            .with_data("assignee", serde_json::json!(agent_id)),
        );

        Ok(task)
    }

    /// Transition a task to a new column and emit `task:status_changed`.
    ///
    /// Fails with [`KanbanError::InvalidTransition`] for edges the state
    /// machine does not allow.
    pub async fn move_task(
        &self,
        actor: Actor<'_>,
        id: &str,
        status: TaskStatus,
        detail: Option<String>,
    ) -> Result<Task, KanbanError> {
        let actor_id = actor.id.to_owned();
        let task_id = id.to_owned();
        let history_detail = detail.clone();
        let (task, previous) = self
            .mutate(move |state| {
                let task = state
                    .task_mut(&task_id)
                    .ok_or(KanbanError::NotFound(task_id.clone()))?;
                let previous = task.status;
                if !previous.can_transition_to(status) {
                    return Err(KanbanError::InvalidTransition {
                        id: task_id.clone(),
                        from: previous,
                        to: status,
                    });
                }
                task.status = status;
                let note = match history_detail {
                    Some(d) => format!("{previous} -> {status}: {d}"),
                    None => format!("{previous} -> {status}"),
                };
                task.history.push(TaskHistoryEvent::now(
                    actor_id,
                    HistoryAction::StatusChanged,
                    Some(note),
                ));
                Ok((task.clone(), previous))
            })
            .await?;

        let mut event = EngineEvent::new(
            EventKind::TaskStatusChanged,
            actor.id,
            actor.role,
            format!("Task {} moved {previous} -> {status}", task.id),
        )
        .with_data("taskId", serde_json::json!(task.id))
        .with_data("from", serde_json::json!(previous.to_string()))
        .with_data("to", serde_json::json!(status.to_string()));
        if let Some(d) = detail {
            event = event.with_detail(d);
        }
        self.bus.emit(event);

        Ok(task)
    }

    /// Append a review comment (comment list + history entry).
    pub async fn add_review_comment(
        &self,
        actor: Actor<'_>,
        id: &str,
        text: &str,
    ) -> Result<Task, KanbanError> {
        let actor_id = actor.id.to_owned();
        let task_id = id.to_owned();
        let comment = text.to_owned();
        self.mutate(move |state| {
            let task = state
                .task_mut(&task_id)
                .ok_or(KanbanError::NotFound(task_id.clone()))?;
            task.review_comments.push(comment.clone());
            task.history.push(TaskHistoryEvent::now(
                actor_id,
                HistoryAction::ReviewComment,
                Some(comment),
            ));
            Ok(task.clone())
        })
        .await
    }
}

/// Generate a fresh opaque short task id.
fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &Path) -> KanbanStore {
        KanbanStore::new(dir, EventBus::new())
    }

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_owned(),
            description: format!("{title} description"),
            acceptance_criteria: vec!["works".into()],
            priority: TaskPriority::Medium,
            epic: None,
            depends_on: vec![],
            context_fingerprint: None,
        }
    }

    const PM: Actor<'_> = Actor {
        id: "pm-1",
        role: "product-manager",
    };
    const SM: Actor<'_> = Actor {
        id: "sm-1",
        role: "scrum-master",
    };

    #[tokio::test]
    async fn init_creates_fresh_state() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());

        let state = store.init().await.unwrap();
        assert!(state.tasks.is_empty());
        assert!(!state.project_id.is_empty());
        assert!(store.state_path().exists());

        // Re-init keeps the same project id.
        let again = store.init().await.unwrap();
        assert_eq!(again.project_id, state.project_id);
    }

    #[tokio::test]
    async fn add_task_populates_defaults_and_history() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();

        let task = store.add_task(PM, new_task("Login")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.created_by, "pm-1");
        assert_eq!(task.history.len(), 1);
        assert_eq!(task.history[0].action, HistoryAction::Created);
        assert_eq!(task.id.len(), 8);

        let all = store.get_all_tasks().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, task.id);
    }

    #[tokio::test]
    async fn add_task_emits_created_event() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let store = KanbanStore::new(dir.path(), bus);
        store.init().await.unwrap();

        let task = store.add_task(PM, new_task("Login")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::TaskCreated);
        assert_eq!(event.agent_id, "pm-1");
        assert_eq!(event.data.unwrap()["taskId"], serde_json::json!(task.id));
    }

    #[tokio::test]
    async fn update_task_merges_and_audits() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();
        let task = store.add_task(PM, new_task("Login")).await.unwrap();

        let updated = store
            .update_task(
                SM,
                &task.id,
                TaskPatch {
                    branch: Some(Some("task/abc".into())),
                    worktree: Some(Some(PathBuf::from("/tmp/wt"))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.branch.as_deref(), Some("task/abc"));
        assert_eq!(updated.title, "Login", "untouched field preserved");
        let last = updated.history.last().unwrap();
        assert_eq!(last.action, HistoryAction::Updated);
        let detail = last.detail.as_deref().unwrap();
        assert!(detail.contains("branch") && detail.contains("worktree"));
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();

        let err = store
            .update_task(SM, "nope", TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KanbanError::NotFound(_)));
    }

    #[tokio::test]
    async fn clearing_worktree_via_patch() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();
        let task = store.add_task(PM, new_task("Login")).await.unwrap();

        store
            .update_task(
                SM,
                &task.id,
                TaskPatch {
                    worktree: Some(Some(PathBuf::from("/tmp/wt"))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let cleared = store
            .update_task(
                SM,
                &task.id,
                TaskPatch {
                    worktree: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.worktree.is_none());
    }

    #[tokio::test]
    async fn move_task_enforces_state_machine() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();
        let task = store.add_task(PM, new_task("Login")).await.unwrap();

        // backlog -> review is not an edge.
        let err = store
            .move_task(SM, &task.id, TaskStatus::Review, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KanbanError::InvalidTransition { .. }));

        let moved = store
            .move_task(SM, &task.id, TaskStatus::InProgress, None)
            .await
            .unwrap();
        assert_eq!(moved.status, TaskStatus::InProgress);
        let note = moved.history.last().unwrap().detail.as_deref().unwrap();
        assert!(note.contains("backlog -> in_progress"));
    }

    #[tokio::test]
    async fn dependencies_met_only_when_all_done() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();

        let dep = store.add_task(PM, new_task("Dep")).await.unwrap();
        let mut input = new_task("Main");
        input.depends_on = vec![dep.id.clone()];
        let main = store.add_task(PM, input).await.unwrap();

        assert!(!store.are_dependencies_met(&main).unwrap());

        store
            .move_task(SM, &dep.id, TaskStatus::InProgress, None)
            .await
            .unwrap();
        store
            .move_task(SM, &dep.id, TaskStatus::Review, None)
            .await
            .unwrap();
        store
            .move_task(SM, &dep.id, TaskStatus::Done, None)
            .await
            .unwrap();

        let main = store.get_task(&main.id).unwrap();
        assert!(store.are_dependencies_met(&main).unwrap());
    }

    #[tokio::test]
    async fn dangling_dependency_is_unmet() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();

        let mut input = new_task("Main");
        input.depends_on = vec!["ghost123".into()];
        let main = store.add_task(PM, input).await.unwrap();
        assert!(!store.are_dependencies_met(&main).unwrap());
    }

    #[tokio::test]
    async fn review_comment_recorded_twice() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();
        let task = store.add_task(PM, new_task("Login")).await.unwrap();

        let task = store
            .add_review_comment(SM, &task.id, "missing tests")
            .await
            .unwrap();
        assert_eq!(task.review_comments, vec!["missing tests"]);
        let last = task.history.last().unwrap();
        assert_eq!(last.action, HistoryAction::ReviewComment);
        assert_eq!(last.detail.as_deref(), Some("missing tests"));
    }

    #[tokio::test]
    async fn state_roundtrip_preserves_tasks() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();
        let task = store.add_task(PM, new_task("Login")).await.unwrap();
        store
            .assign_task(SM, &task.id, "eng-1")
            .await
            .unwrap();

        let reloaded = KanbanStore::new(dir.path(), EventBus::new());
        let state = reloaded.load().unwrap();
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].assignee.as_deref(), Some("eng-1"));
        assert_eq!(state.tasks[0].history.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_state_surfaces_as_state_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();
        std::fs::write(store.state_path(), "{ not json").unwrap();

        let err = store.get_all_tasks().unwrap_err();
        assert!(matches!(err, KanbanError::StateCorrupt { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_serialize() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.init().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .add_task(PM, new_task(&format!("Task {i}")))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let all = store.get_all_tasks().unwrap();
        assert_eq!(all.len(), 8, "every concurrent append must survive");
        let mut ids: Vec<_> = all.iter().map(|t| t.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8, "ids must be unique");
    }
}
