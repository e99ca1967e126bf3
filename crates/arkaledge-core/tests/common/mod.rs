//! Shared test doubles: a scripted agent runtime that answers by prompt
//! shape, so one instance can serve probes, planning, execution and review
//! without brittle call ordering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use arkaledge_core::runtime::{AgentMessage, AgentRuntime, MessageStream, RunOptions};

/// One scripted response for a work or review prompt.
pub enum Step {
    /// Yield these messages, then end the stream.
    Reply(Vec<AgentMessage>),
    /// Fail to produce a stream at all.
    Fail(String),
}

impl Step {
    pub fn text(content: &str) -> Self {
        Step::Reply(vec![AgentMessage::text(content)])
    }

    pub fn failing_tests() -> Self {
        Step::Reply(vec![AgentMessage::tool_result(
            "running 3 tests\ntests FAILED: 2 passed, 1 failed",
        )])
    }

    pub fn approve() -> Self {
        Step::text(r#"{"verdict": "approved", "comments": []}"#)
    }

    pub fn reject(comment: &str) -> Self {
        Step::text(&format!(
            r#"{{"verdict": "rejected", "comments": ["{comment}"]}}"#
        ))
    }
}

/// Scripted runtime: routes prompts to queues by shape.
///
/// - Health probes (prompt mentions HEALTH_OK) echo the token.
/// - Planner prompts (contain "## Specification") reply with the plan.
/// - Review prompts (contain "Diff against main") pop the review queue.
/// - Everything else pops the work queue.
///
/// Exhausted queues fall back to a plain success reply.
#[derive(Default)]
pub struct ScriptedRuntime {
    plan: Mutex<Option<String>>,
    work: Mutex<VecDeque<Step>>,
    review: Mutex<VecDeque<Step>>,
    pub plan_calls: AtomicUsize,
    pub work_calls: AtomicUsize,
    pub review_calls: AtomicUsize,
    pub aborts: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(self, plan_json: &str) -> Self {
        *self.plan.lock().unwrap() = Some(plan_json.to_owned());
        self
    }

    pub fn with_work(self, steps: Vec<Step>) -> Self {
        *self.work.lock().unwrap() = steps.into();
        self
    }

    pub fn with_review(self, steps: Vec<Step>) -> Self {
        *self.review.lock().unwrap() = steps.into();
        self
    }

    fn stream_for(step: Option<Step>, fallback: &str) -> Result<MessageStream> {
        match step {
            Some(Step::Reply(messages)) => Ok(Box::pin(futures::stream::iter(messages))),
            Some(Step::Fail(reason)) => Err(anyhow!(reason)),
            None => Ok(Box::pin(futures::stream::iter(vec![AgentMessage::text(
                fallback,
            )]))),
        }
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn run(&self, prompt: &str, _options: &RunOptions) -> Result<MessageStream> {
        if prompt.contains("HEALTH_OK") {
            return Ok(Box::pin(futures::stream::iter(vec![AgentMessage::text(
                "HEALTH_OK",
            )])));
        }
        if prompt.contains("## Specification") {
            self.plan_calls.fetch_add(1, Ordering::SeqCst);
            let plan = self.plan.lock().unwrap().clone().unwrap_or_else(|| "[]".into());
            return Ok(Box::pin(futures::stream::iter(vec![AgentMessage::text(
                plan,
            )])));
        }
        if prompt.contains("Diff against main") {
            self.review_calls.fetch_add(1, Ordering::SeqCst);
            let step = self.review.lock().unwrap().pop_front();
            return Self::stream_for(step, r#"{"verdict": "approved", "comments": []}"#);
        }
        self.work_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.work.lock().unwrap().pop_front();
        Self::stream_for(step, "implemented the task")
    }

    async fn resume(
        &self,
        _session_id: &str,
        prompt: &str,
        options: &RunOptions,
    ) -> Result<MessageStream> {
        self.run(prompt, options).await
    }

    async fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}
