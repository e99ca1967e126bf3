//! Executor role: implement one task end-to-end inside its worktree, with
//! a bounded self-correction loop, and guarantee a commit exists on the
//! task branch before the task enters review.

use futures::StreamExt;

use arkaledge_events::{EngineEvent, EventBus, EventKind};
use arkaledge_store::{Actor, KanbanStore, Task, TaskPatch, TaskStatus};

use crate::context::ProjectContext;
use crate::roles::{has_nonzero_exit, tail_chars, truncate_chars};
use crate::runtime::{AgentMessage, AgentRuntime, MessageKind, RunOptions};
use crate::team::AgentSpec;
use crate::worktree::WorktreeManager;

const SYSTEM_PROMPT: &str = "\
You are a software engineer working on one task inside a dedicated git worktree.
Inspect the project to understand its stack and conventions, implement the task,
write tests for the new behavior, and run the project's test suite.
Commit nothing yourself; the orchestrator handles commits.
Work only inside the worktree directory you are given.";

/// Full-transcript retention for forensics.
const MAX_TRANSCRIPT_CHARS: usize = 20_000;

/// Diagnostics-only transcript retention.
const MAX_DIAGNOSTICS_CHARS: usize = 10_000;

/// How much diagnostics tail is replayed into a fix-it prompt.
const FOLLOW_UP_TAIL_CHARS: usize = 4_000;

/// Substrings (matched case-insensitively against the diagnostics
/// transcript) that classify an attempt as failed.
const FAILURE_PATTERNS: &[&str] = &[
    "rate limit",
    "limit reached",
    "usage limit",
    "assertionerror",
    "assertion failed",
    "tests failed",
    "test failed",
    "failing tests",
    "npm err!",
    "traceback (most recent call last)",
    "error[e",
    "fatal:",
];

/// Terminal result of one executor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorOutcome {
    /// The task reached `review`.
    Completed,
    /// The task was moved to `blocked`.
    Blocked,
}

/// Drives one task through implementation.
pub struct Executor<'a> {
    pub runtime: &'a dyn AgentRuntime,
    pub agent: &'a AgentSpec,
    pub store: &'a KanbanStore,
    pub worktrees: &'a WorktreeManager,
    pub context: &'a ProjectContext,
    pub bus: &'a EventBus,
    pub max_retries: u32,
}

impl Executor<'_> {
    fn actor(&self) -> Actor<'_> {
        Actor {
            id: self.agent.id.as_str(),
            role: "engineer",
        }
    }

    /// Run the task to completion or a blocked terminal state.
    pub async fn run(&self, task: &Task) -> anyhow::Result<ExecutorOutcome> {
        let (Some(branch), Some(worktree)) = (task.branch.clone(), task.worktree.clone()) else {
            self.store
                .move_task(
                    self.actor(),
                    &task.id,
                    TaskStatus::Blocked,
                    Some("missing worktree metadata".to_owned()),
                )
                .await?;
            return Ok(ExecutorOutcome::Blocked);
        };

        self.bus.emit(
            EngineEvent::new(
                EventKind::AgentStarted,
                self.agent.id.as_str(),
                "engineer",
                format!("Working on task: {}", task.title),
            )
            .with_data("taskId", serde_json::json!(task.id))
            .with_data("branch", serde_json::json!(branch)),
        );

        let options = RunOptions {
            system_prompt: Some(SYSTEM_PROMPT.to_owned()),
            working_dir: Some(worktree.clone()),
            allowed_tools: Some(self.agent.tools.clone()),
            ..Default::default()
        };

        let mut retry_count = task.retry_count;
        let mut session_id: Option<String> = None;
        let mut prompt = self.task_prompt(task, &branch, &worktree);

        loop {
            let attempt = Attempt::collect(
                self.runtime,
                self.agent.id.as_str(),
                self.bus,
                &prompt,
                session_id.as_deref(),
                &options,
            )
            .await;
            if attempt.session_id.is_some() {
                session_id = attempt.session_id.clone();
            }

            let Some(reason) = attempt.failure_reason() else {
                break;
            };

            tracing::info!(
                task_id = %task.id,
                agent = %self.agent.id,
                retry_count,
                reason = %truncate_chars(&reason, 200),
                "executor attempt failed"
            );

            if retry_count >= self.max_retries {
                let detail = format!("Failed after {retry_count} retries: {reason}");
                self.store
                    .move_task(self.actor(), &task.id, TaskStatus::Blocked, Some(detail.clone()))
                    .await?;
                self.bus.emit(
                    EngineEvent::new(
                        EventKind::AgentError,
                        self.agent.id.as_str(),
                        "engineer",
                        format!("Task {} failed after {retry_count} retries", task.id),
                    )
                    .with_detail(detail)
                    .with_data("taskId", serde_json::json!(task.id)),
                );
                return Ok(ExecutorOutcome::Blocked);
            }

            retry_count += 1;
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

            prompt = format!(
                "The previous attempt did not pass. Diagnostics from the run:\n\n\
                 ```\n{}\n```\n\n\
                 Fix the problems and make the tests pass.",
                tail_chars(&attempt.diagnostics, FOLLOW_UP_TAIL_CHARS)
            );
        }

        // Commit enforcement: the branch must be ahead of main before the
        // task may enter review.
        if let Err(reason) = self.enforce_commit(task, &branch, &worktree) {
            let detail = format!("Commit required before review: {reason}");
            self.store
                .move_task(self.actor(), &task.id, TaskStatus::Blocked, Some(detail.clone()))
                .await?;
            self.bus.emit(
                EngineEvent::new(
                    EventKind::AgentError,
                    self.agent.id.as_str(),
                    "engineer",
                    format!("Task {} has no commit on its branch", task.id),
                )
                .with_detail(detail)
                .with_data("taskId", serde_json::json!(task.id)),
            );
            return Ok(ExecutorOutcome::Blocked);
        }

        self.bus.emit(
            EngineEvent::new(
                EventKind::AgentCompleted,
                self.agent.id.as_str(),
                "engineer",
                format!("Completed task: {}", task.title),
            )
            .with_data("taskId", serde_json::json!(task.id))
            .with_data("branch", serde_json::json!(branch))
            .with_data("worktree", serde_json::json!(worktree))
            .with_data("artifacts", serde_json::json!(task.artifacts)),
        );

        self.store
            .move_task(
                self.actor(),
                &task.id,
                TaskStatus::Review,
                Some("implementation complete".to_owned()),
            )
            .await?;

        Ok(ExecutorOutcome::Completed)
    }

    fn task_prompt(&self, task: &Task, branch: &str, worktree: &std::path::Path) -> String {
        let mut prompt = format!(
            "{}\n## Task: {}\n\n{}\n",
            self.context.preamble(),
            task.title,
            task.description
        );
        if !task.acceptance_criteria.is_empty() {
            prompt.push_str("\n### Acceptance criteria\n");
            for criterion in &task.acceptance_criteria {
                prompt.push_str(&format!("- {criterion}\n"));
            }
        }
        if !task.review_comments.is_empty() {
            prompt.push_str("\n### Review feedback to address\n");
            for comment in &task.review_comments {
                prompt.push_str(&format!("- {comment}\n"));
            }
        }
        prompt.push_str(&format!(
            "\nWorktree: {}\nBranch: {branch}\n",
            worktree.display()
        ));
        prompt
    }

    /// Ensure the branch is ahead of main, creating a commit if necessary.
    fn enforce_commit(
        &self,
        task: &Task,
        branch: &str,
        worktree: &std::path::Path,
    ) -> Result<(), String> {
        let ahead = self
            .worktrees
            .commits_ahead_of_main(branch)
            .map_err(|e| e.to_string())?;
        if ahead == 0 {
            if self.worktrees.is_clean(worktree).map_err(|e| e.to_string())? {
                self.worktrees
                    .commit_empty(worktree, &format!("chore({}): {}", task.id, task.title))
                    .map_err(|e| e.to_string())?;
            } else {
                self.worktrees
                    .commit_all(worktree, &format!("feat({}): {}", task.id, task.title))
                    .map_err(|e| e.to_string())?;
            }

            let ahead = self
                .worktrees
                .commits_ahead_of_main(branch)
                .map_err(|e| e.to_string())?;
            if ahead == 0 {
                return Err("branch still not ahead of main after commit".to_owned());
            }
        }
        Ok(())
    }
}

/// One backend attempt: both transcripts plus any captured session id.
struct Attempt {
    messages: Vec<AgentMessage>,
    diagnostics: String,
    session_id: Option<String>,
    stream_error: Option<String>,
}

impl Attempt {
    async fn collect(
        runtime: &dyn AgentRuntime,
        agent_id: &str,
        bus: &EventBus,
        prompt: &str,
        session_id: Option<&str>,
        options: &RunOptions,
    ) -> Self {
        let mut attempt = Self {
            messages: Vec::new(),
            diagnostics: String::new(),
            session_id: None,
            stream_error: None,
        };

        let stream = match session_id {
            Some(session) => runtime.resume(session, prompt, options).await,
            None => runtime.run(prompt, options).await,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                attempt.stream_error = Some(format!("backend stream error: {e:#}"));
                return attempt;
            }
        };

        let mut transcript_len = 0usize;
        while let Some(message) = stream.next().await {
            bus.emit(
                EngineEvent::new(
                    EventKind::AgentMessage,
                    agent_id,
                    "engineer",
                    truncate_chars(&message.content, 120).to_owned(),
                )
                .with_data("kind", serde_json::json!(message.kind)),
            );

            if let Some(session) = message.session_id() {
                attempt.session_id = Some(session.to_owned());
            }
            if message.is_diagnostic() && attempt.diagnostics.len() < MAX_DIAGNOSTICS_CHARS {
                attempt.diagnostics.push_str(truncate_chars(
                    &message.content,
                    MAX_DIAGNOSTICS_CHARS - attempt.diagnostics.len(),
                ));
                attempt.diagnostics.push('\n');
            }
            if transcript_len < MAX_TRANSCRIPT_CHARS {
                transcript_len += message.content.len();
                attempt.messages.push(message);
            }
        }

        attempt
    }

    /// Classify the attempt. `None` means success.
    fn failure_reason(&self) -> Option<String> {
        if let Some(error) = &self.stream_error {
            return Some(error.clone());
        }
        if let Some(message) = self
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::Error)
        {
            return Some(truncate_chars(&message.content, 300).to_owned());
        }

        let lower = self.diagnostics.to_lowercase();
        if has_nonzero_exit(&lower) {
            return Some("command exited with a non-zero code".to_owned());
        }
        FAILURE_PATTERNS
            .iter()
            .find(|pattern| lower.contains(**pattern))
            .map(|pattern| format!("diagnostics matched failure pattern: {pattern}"))
    }
}
