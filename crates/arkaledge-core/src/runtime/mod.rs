//! The `AgentRuntime` trait -- the adapter interface for agent backends.
//!
//! The engine never talks to a model SDK directly. Each backend (Claude
//! Code, Codex CLI, ...) is wrapped in an adapter implementing this trait
//! and exposing its output as a stream of [`AgentMessage`]s. The trait is
//! object-safe so adapters can be stored as `Arc<dyn AgentRuntime>`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

/// Boxed stream of backend output.
pub type MessageStream = Pin<Box<dyn Stream<Item = AgentMessage> + Send>>;

/// Metadata key under which backends report a resumable session id.
pub const SESSION_ID_KEY: &str = "sessionId";

/// Kind tag of a backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    ToolCall,
    ToolResult,
    Error,
    Summary,
}

/// One message streamed out of a backend run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl AgentMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, content)
    }

    pub fn tool_result(content: impl Into<String>) -> Self {
        Self::new(MessageKind::ToolResult, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content)
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// The backend session id, if this message carries one.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(SESSION_ID_KEY))
            .map(String::as_str)
    }

    /// Whether this message belongs in the diagnostics-only transcript.
    pub fn is_diagnostic(&self) -> bool {
        matches!(self.kind, MessageKind::ToolResult | MessageKind::Error)
    }
}

/// Options passed to a backend run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// System prompt constraining the agent.
    pub system_prompt: Option<String>,
    /// Working directory the agent operates in.
    pub working_dir: Option<PathBuf>,
    /// Tool allow-list, if the backend supports one.
    pub allowed_tools: Option<Vec<String>>,
    /// Structured-output schema hint, if the backend supports one.
    pub output_schema: Option<serde_json::Value>,
    /// Backend-side wall clock limit.
    pub timeout: Option<Duration>,
}

/// Adapter interface for streaming agent backends.
///
/// # Object Safety
///
/// Every method returns a concrete type or a boxed stream, so the trait can
/// be used as `dyn AgentRuntime`.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start a fresh backend run with the given prompt.
    async fn run(&self, prompt: &str, options: &RunOptions) -> Result<MessageStream>;

    /// Continue a prior session, if the backend supports resumption.
    ///
    /// Backends without session support should treat this as a fresh run.
    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        options: &RunOptions,
    ) -> Result<MessageStream>;

    /// Best-effort cancellation of any in-flight run.
    async fn abort(&self);
}

// Compile-time assertion: AgentRuntime must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentRuntime) {}
};
