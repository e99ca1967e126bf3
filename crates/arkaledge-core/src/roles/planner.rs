//! Planner role: one backend invocation that turns a product spec into a
//! structured task list, materialized on the kanban in two passes so
//! dependency edges use stable task ids instead of positional indices.

use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;

use arkaledge_events::{EngineEvent, EventBus, EventKind};
use arkaledge_store::{Actor, KanbanError, KanbanStore, NewTask, Task, TaskPatch, TaskPriority};

use crate::context::ProjectContext;
use crate::roles::{extract_json_array, truncate_chars};
use crate::runtime::{AgentRuntime, MessageKind, RunOptions};
use crate::team::AgentSpec;

const SYSTEM_PROMPT: &str = "\
You are a software product manager decomposing a specification into engineering tasks.
Respond with ONLY a JSON array, no prose, no markdown outside the array.
Each element: {
  \"title\": string,
  \"description\": string,
  \"acceptanceCriteria\": string[],
  \"priority\": \"high\" | \"medium\" | \"low\",
  \"epic\": string (optional),
  \"dependsOn\": number[] (optional; 0-based indices of EARLIER tasks in this array)
}
Order tasks so that every dependency appears before its dependents.";

/// Errors from the planning pass.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner backend failed: {0}")]
    Runtime(String),

    #[error("planner produced no parsable task list: {output}")]
    Parse { output: String },

    #[error("planner produced an empty task list")]
    NoTasks,

    #[error(transparent)]
    Store(#[from] KanbanError),
}

/// One element of the planner's JSON output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannedTask {
    title: String,
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    priority: TaskPriority,
    #[serde(default)]
    epic: Option<String>,
    #[serde(default)]
    depends_on: Vec<usize>,
}

/// Drive the planner backend and materialize its tasks on the board.
///
/// Returns the created tasks in plan order.
pub async fn run_planner(
    runtime: &dyn AgentRuntime,
    planner: &AgentSpec,
    spec_text: &str,
    context: &ProjectContext,
    store: &KanbanStore,
    bus: &EventBus,
) -> Result<Vec<Task>, PlannerError> {
    let actor = Actor {
        id: planner.id.as_str(),
        role: "product-manager",
    };

    bus.emit(EngineEvent::new(
        EventKind::AgentStarted,
        planner.id.as_str(),
        "product-manager",
        "Planning tasks from specification",
    ));

    let prompt = format!(
        "{}\n\n## Specification\n\n{spec_text}\n\nDecompose this specification into tasks.",
        context.preamble()
    );
    let options = RunOptions {
        system_prompt: Some(SYSTEM_PROMPT.to_owned()),
        allowed_tools: Some(planner.tools.clone()),
        ..Default::default()
    };

    let mut stream = runtime
        .run(&prompt, &options)
        .await
        .map_err(|e| PlannerError::Runtime(format!("{e:#}")))?;

    // Forward every message for observability while collecting the text.
    let mut output = String::new();
    while let Some(message) = stream.next().await {
        bus.emit(
            EngineEvent::new(
                EventKind::AgentMessage,
                planner.id.as_str(),
                "product-manager",
                truncate_chars(&message.content, 120).to_owned(),
            )
            .with_data("kind", serde_json::json!(message.kind)),
        );
        if message.kind == MessageKind::Text {
            output.push_str(&message.content);
            output.push('\n');
        }
    }

    let planned = parse_plan(&output)?;
    tracing::info!(count = planned.len(), "planner produced tasks");

    // Pass 1: append every task, capturing assigned ids in plan order.
    let mut created = Vec::with_capacity(planned.len());
    for task in &planned {
        let stored = store
            .add_task(
                actor,
                NewTask {
                    title: task.title.clone(),
                    description: task.description.clone(),
                    acceptance_criteria: task.acceptance_criteria.clone(),
                    priority: task.priority,
                    epic: task.epic.clone(),
                    depends_on: Vec::new(),
                    context_fingerprint: Some(context.fingerprint.clone()),
                },
            )
            .await?;
        created.push(stored);
    }

    // Pass 2: translate index edges to the real ids, dropping indices that
    // are out of range or not strictly earlier in the plan.
    for (index, task) in planned.iter().enumerate() {
        if task.depends_on.is_empty() {
            continue;
        }
        let dep_ids: Vec<String> = task
            .depends_on
            .iter()
            .filter(|&&dep| dep < index)
            .map(|&dep| created[dep].id.clone())
            .collect();
        if dep_ids.len() != task.depends_on.len() {
            tracing::warn!(
                task = %created[index].id,
                "dropped invalid dependency indices from plan"
            );
        }
        if dep_ids.is_empty() {
            continue;
        }
        let updated = store
            .update_task(
                actor,
                &created[index].id,
                TaskPatch {
                    depends_on: Some(dep_ids),
                    ..Default::default()
                },
            )
            .await?;
        created[index] = updated;
    }

    bus.emit(
        EngineEvent::new(
            EventKind::AgentCompleted,
            planner.id.as_str(),
            "product-manager",
            format!("Planned {} tasks", created.len()),
        )
        .with_data(
            "taskIds",
            serde_json::json!(created.iter().map(|t| t.id.clone()).collect::<Vec<_>>()),
        ),
    );

    Ok(created)
}

/// Tolerantly parse the collected output into the plan schema.
fn parse_plan(output: &str) -> Result<Vec<PlannedTask>, PlannerError> {
    let value = extract_json_array(output).ok_or_else(|| PlannerError::Parse {
        output: truncate_chars(output, 500).to_owned(),
    })?;
    let planned: Vec<PlannedTask> =
        serde_json::from_value(value).map_err(|_| PlannerError::Parse {
            output: truncate_chars(output, 500).to_owned(),
        })?;
    if planned.is_empty() {
        return Err(PlannerError::NoTasks);
    }
    Ok(planned)
}
