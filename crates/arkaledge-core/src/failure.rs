//! Failure pipeline for blocked tasks: retry with exponential backoff,
//! reassign to a distinct backend, or permanently block.
//!
//! The scheduler hands every `blocked` task through [`FailureHandler::
//! handle_blocked`] at the start of each tick. Reasons classified as
//! unrecoverable skip straight to the permanent block, which is announced
//! exactly once per task lifetime.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use arkaledge_events::{EngineEvent, EventBus, EventKind};
use arkaledge_store::{Actor, KanbanStore, Task, TaskPatch, TaskStatus};

use crate::team::TeamConfig;

/// Reasons that short-circuit the retry/reassign pipeline (matched
/// case-insensitively against the latest status-change detail).
const UNRECOVERABLE_PATTERNS: &[&str] = &[
    "merge/cleanup failed",
    "would be overwritten by merge",
    "auto-approval merge failed",
];

/// What the pipeline decided for one blocked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Backoff elapsed; the task went back to `backlog` with an
    /// incremented retry count.
    Retried,
    /// The task went back to `backlog` unassigned, for an engineer on a
    /// different backend or model.
    Reassigned,
    /// The task stays `blocked` permanently.
    Blocked,
}

/// Drives the three-stage pipeline for blocked tasks.
pub struct FailureHandler {
    store: KanbanStore,
    bus: EventBus,
    team: TeamConfig,
    max_retries: u32,
    scrum_master_id: String,
    /// Task ids whose permanent block has already been announced.
    announced_blocks: Mutex<HashSet<String>>,
}

impl FailureHandler {
    pub fn new(store: KanbanStore, bus: EventBus, team: TeamConfig) -> Self {
        let max_retries = team.workflow.max_retries;
        let scrum_master_id = team.scrum_master_id().to_owned();
        Self {
            store,
            bus,
            team,
            max_retries,
            scrum_master_id,
            announced_blocks: Mutex::new(HashSet::new()),
        }
    }

    fn actor(&self) -> Actor<'_> {
        Actor {
            id: &self.scrum_master_id,
            role: "scrum-master",
        }
    }

    /// Run the pipeline for one blocked task.
    pub async fn handle_blocked(&self, task: &Task) -> anyhow::Result<FailureAction> {
        let reason = task
            .last_status_change()
            .and_then(|h| h.detail.clone())
            .unwrap_or_else(|| "unknown failure".to_owned());

        // Stage 1: classification.
        if is_unrecoverable(&reason) {
            return Ok(self.block_permanently(task, &reason));
        }

        // Stage 2: retry with exponential backoff.
        if task.retry_count < self.max_retries {
            let backoff = Duration::from_secs(1u64 << (task.retry_count + 1));
            tracing::info!(
                task_id = %task.id,
                retry = task.retry_count + 1,
                backoff_secs = backoff.as_secs(),
                "retrying blocked task after backoff"
            );
            tokio::time::sleep(backoff).await;

            let retry_count = task.retry_count + 1;
            self.store
                .update_task(
                    self.actor(),
                    &task.id,
                    TaskPatch {
                        retry_count: Some(retry_count),
                        ..Default::default()
                    },
                )
                .await?;
            self.store
                .move_task(
                    self.actor(),
                    &task.id,
                    TaskStatus::Backlog,
                    Some(format!("retry {retry_count}/{}", self.max_retries)),
                )
                .await?;
            return Ok(FailureAction::Retried);
        }

        // Stage 3: reassign to an engineer on a different backend or model.
        if let Some(alternate) = self.alternate_engineer(task) {
            tracing::info!(
                task_id = %task.id,
                alternate = %alternate,
                "reassigning blocked task to a different backend"
            );
            self.store
                .update_task(
                    self.actor(),
                    &task.id,
                    TaskPatch {
                        retry_count: Some(0),
                        assignee: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            self.store
                .move_task(
                    self.actor(),
                    &task.id,
                    TaskStatus::Backlog,
                    Some(format!("reassigned away from {}", task.assignee.as_deref().unwrap_or("unassigned"))),
                )
                .await?;
            return Ok(FailureAction::Reassigned);
        }

        // Stage 4: permanent block.
        Ok(self.block_permanently(task, &reason))
    }

    /// An engineer whose backend tag or model differs from the original
    /// assignee's, if the roster has one.
    fn alternate_engineer(&self, task: &Task) -> Option<String> {
        let assignee_id = task.assignee.as_deref()?;
        let assignee = self.team.agent(assignee_id)?;
        self.team
            .engineers()
            .into_iter()
            .find(|e| {
                e.id != assignee.id
                    && (e.backend != assignee.backend || e.model != assignee.model)
            })
            .map(|e| e.id.clone())
    }

    /// Emit the permanent-block `agent:error` exactly once per task.
    fn block_permanently(&self, task: &Task, reason: &str) -> FailureAction {
        let mut announced = self
            .announced_blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if announced.insert(task.id.clone()) {
            self.bus.emit(
                EngineEvent::new(
                    EventKind::AgentError,
                    self.scrum_master_id.as_str(),
                    "scrum-master",
                    format!("Task {} permanently blocked", task.id),
                )
                .with_detail(reason.to_owned())
                .with_data("taskId", serde_json::json!(task.id))
                .with_data("reason", serde_json::json!(reason)),
            );
        }
        FailureAction::Blocked
    }
}

/// Whether a failure reason short-circuits to the permanent block.
pub fn is_unrecoverable(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    UNRECOVERABLE_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}
