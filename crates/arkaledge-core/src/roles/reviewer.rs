//! Reviewer role: decide approval for one task in `review` and execute the
//! follow-up (merge to main, or send the task back with comments).

use serde::Deserialize;

use arkaledge_events::{EngineEvent, EventBus, EventKind};
use arkaledge_store::{Actor, KanbanStore, Task, TaskPatch, TaskStatus};

use crate::context::ProjectContext;
use crate::roles::{extract_json_object, truncate_chars};
use crate::runtime::{AgentRuntime, MessageKind, RunOptions};
use crate::team::AgentSpec;
use crate::watchdog::{consume_stream, WatchdogLimits};
use crate::worktree::WorktreeManager;

const SYSTEM_PROMPT: &str = "\
You are a senior software engineer reviewing a colleague's change.
Review the diff for correctness, test coverage, error handling, security,
and quality appropriate to the project's stack.
Respond with ONLY JSON of shape:
{ \"verdict\": \"approved\" | \"rejected\", \"comments\": string[] }
Reject when acceptance criteria are unmet or the change is unsafe.";

/// At most this many characters of the diff are shown to the reviewer.
const DIFF_CAP_CHARS: usize = 20_000;

/// Result of one review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    Approved,
    Rejected,
    /// The review could not complete; the task was moved to `blocked`.
    Blocked,
}

#[derive(Debug, Deserialize)]
struct VerdictJson {
    verdict: String,
    #[serde(default)]
    comments: Vec<String>,
}

/// Reviews one task already in `review`.
pub struct Reviewer<'a> {
    pub runtime: &'a dyn AgentRuntime,
    pub agent: &'a AgentSpec,
    pub store: &'a KanbanStore,
    pub worktrees: &'a WorktreeManager,
    pub context: &'a ProjectContext,
    pub bus: &'a EventBus,
    pub auto_merge: bool,
}

impl Reviewer<'_> {
    fn role(&self) -> String {
        self.agent.role.to_string()
    }

    fn actor(&self) -> Actor<'_> {
        Actor {
            id: self.agent.id.as_str(),
            role: "reviewer",
        }
    }

    pub async fn run(&self, task: &Task) -> anyhow::Result<ReviewOutcome> {
        let Some(branch) = task.branch.clone() else {
            self.store
                .move_task(
                    self.actor(),
                    &task.id,
                    TaskStatus::Blocked,
                    Some("missing branch metadata".to_owned()),
                )
                .await?;
            return Ok(ReviewOutcome::Blocked);
        };

        self.bus.emit(
            EngineEvent::new(
                EventKind::ReviewStarted,
                self.agent.id.as_str(),
                self.role(),
                format!("Reviewing task: {}", task.title),
            )
            .with_data("taskId", serde_json::json!(task.id))
            .with_data("author", serde_json::json!(task.assignee)),
        );

        // 1. Fetch the diff.
        let diff = match self.worktrees.diff_against_main(&branch) {
            Ok(diff) => diff,
            Err(e) => {
                let detail = format!("Failed to get diff: {e}");
                self.block(task, detail).await?;
                return Ok(ReviewOutcome::Blocked);
            }
        };

        // 2. Run the backend under the watchdog.
        let prompt = self.review_prompt(task, &branch, &diff);
        let options = RunOptions {
            system_prompt: Some(SYSTEM_PROMPT.to_owned()),
            allowed_tools: Some(self.agent.tools.clone()),
            ..Default::default()
        };

        let stream = match self.runtime.run(&prompt, &options).await {
            Ok(stream) => stream,
            Err(e) => {
                let detail = format!("Review watchdog timeout/failure: {e:#}");
                self.block(task, detail).await?;
                return Ok(ReviewOutcome::Blocked);
            }
        };

        let agent_id = self.agent.id.clone();
        let role = self.role();
        let bus = self.bus.clone();
        let consumed = consume_stream(stream, WatchdogLimits::review(), |message| {
            bus.emit(
                EngineEvent::new(
                    EventKind::AgentMessage,
                    agent_id.as_str(),
                    role.clone(),
                    truncate_chars(&message.content, 120).to_owned(),
                )
                .with_data("kind", serde_json::json!(message.kind)),
            );
        })
        .await;

        let messages = match consumed {
            Ok(messages) => messages,
            Err(timeout) => {
                self.runtime.abort().await;
                let detail = format!("Review watchdog timeout/failure: {timeout}");
                self.block(task, detail).await?;
                return Ok(ReviewOutcome::Blocked);
            }
        };

        // 3. Parse the verdict; parse failure counts as a rejection with
        // the raw output as the single comment.
        let output: String = messages
            .iter()
            .filter(|m| m.kind == MessageKind::Text)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let verdict = parse_verdict(&output);
        match verdict {
            Some(v) if v.verdict == "approved" => self.approve(task, &branch).await,
            Some(v) => self.reject(task, v.comments).await,
            None => {
                tracing::warn!(task_id = %task.id, "reviewer verdict unparsable, rejecting");
                self.reject(task, vec![output]).await
            }
        }
    }

    fn review_prompt(&self, task: &Task, branch: &str, diff: &str) -> String {
        let mut prompt = format!(
            "{}\n## Review: {}\n\n{}\n",
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
            prompt.push_str("\n### Earlier review comments\n");
            for comment in &task.review_comments {
                prompt.push_str(&format!("- {comment}\n"));
            }
        }
        prompt.push_str(&format!(
            "\nBranch: {branch}\n\n### Diff against main\n\n```diff\n{}\n```\n",
            truncate_chars(diff, DIFF_CAP_CHARS)
        ));
        prompt
    }

    async fn approve(&self, task: &Task, branch: &str) -> anyhow::Result<ReviewOutcome> {
        if self.auto_merge {
            if let Err(e) = self.merge_and_cleanup(task, branch).await {
                let detail = format!("Merge/cleanup failed: {e}");
                self.block(task, detail).await?;
                return Ok(ReviewOutcome::Blocked);
            }
            self.store
                .move_task(
                    self.actor(),
                    &task.id,
                    TaskStatus::Done,
                    Some("approved and merged".to_owned()),
                )
                .await?;
        } else {
            self.store
                .move_task(
                    self.actor(),
                    &task.id,
                    TaskStatus::Done,
                    Some("manual merge required".to_owned()),
                )
                .await?;
        }

        self.bus.emit(
            EngineEvent::new(
                EventKind::ReviewApproved,
                self.agent.id.as_str(),
                self.role(),
                format!("Approved task: {}", task.title),
            )
            .with_data("taskId", serde_json::json!(task.id))
            .with_data("branch", serde_json::json!(branch)),
        );
        Ok(ReviewOutcome::Approved)
    }

    async fn merge_and_cleanup(&self, task: &Task, branch: &str) -> anyhow::Result<()> {
        self.worktrees.merge_to_main(branch)?;

        // A `ui` artifact pins the worktree so its files stay servable.
        if !task.has_ui_artifact() {
            self.worktrees.remove_worktree(&task.id)?;
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
        Ok(())
    }

    async fn reject(&self, task: &Task, comments: Vec<String>) -> anyhow::Result<ReviewOutcome> {
        for comment in &comments {
            self.store
                .add_review_comment(self.actor(), &task.id, comment)
                .await?;
        }
        self.store
            .move_task(
                self.actor(),
                &task.id,
                TaskStatus::InProgress,
                Some("review rejected".to_owned()),
            )
            .await?;

        self.bus.emit(
            EngineEvent::new(
                EventKind::ReviewRejected,
                self.agent.id.as_str(),
                self.role(),
                format!("Rejected task: {}", task.title),
            )
            .with_data("taskId", serde_json::json!(task.id))
            .with_data("comments", serde_json::json!(comments)),
        );
        Ok(ReviewOutcome::Rejected)
    }

    async fn block(&self, task: &Task, detail: String) -> anyhow::Result<()> {
        self.store
            .move_task(self.actor(), &task.id, TaskStatus::Blocked, Some(detail.clone()))
            .await?;
        self.bus.emit(
            EngineEvent::new(
                EventKind::AgentError,
                self.agent.id.as_str(),
                self.role(),
                format!("Review of task {} failed", task.id),
            )
            .with_detail(detail)
            .with_data("taskId", serde_json::json!(task.id)),
        );
        Ok(())
    }
}

/// Tolerant parse of the verdict JSON. `None` when no object with a valid
/// verdict field could be extracted.
fn parse_verdict(output: &str) -> Option<VerdictJson> {
    let value = extract_json_object(output)?;
    let verdict: VerdictJson = serde_json::from_value(value).ok()?;
    match verdict.verdict.as_str() {
        "approved" | "rejected" => Some(verdict),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_verdict() {
        let v = parse_verdict(r#"{"verdict": "approved", "comments": []}"#).unwrap();
        assert_eq!(v.verdict, "approved");
        assert!(v.comments.is_empty());
    }

    #[test]
    fn parses_fenced_verdict_with_prose() {
        let output = "Looks solid overall.\n```json\n{\"verdict\": \"rejected\", \"comments\": [\"missing error handling\"]}\n```";
        let v = parse_verdict(output).unwrap();
        assert_eq!(v.verdict, "rejected");
        assert_eq!(v.comments, vec!["missing error handling"]);
    }

    #[test]
    fn missing_comments_defaults_empty() {
        let v = parse_verdict(r#"{"verdict": "approved"}"#).unwrap();
        assert!(v.comments.is_empty());
    }

    #[test]
    fn unknown_verdict_value_fails_parse() {
        assert!(parse_verdict(r#"{"verdict": "maybe", "comments": []}"#).is_none());
    }

    #[test]
    fn prose_fails_parse() {
        assert!(parse_verdict("I think this is fine, ship it").is_none());
    }
}
