//! Event taxonomy and the in-process event bus.
//!
//! Every component of the engine reports state changes as [`EngineEvent`]
//! records published on an [`EventBus`]. Subscribers either take the
//! wildcard feed (everything, in bus order) or filter to a single kind.
//! The bus is process-local: events are not persisted beyond the broadcast
//! channel's ring buffer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the broadcast ring buffer.
///
/// Slow subscribers that fall more than this many events behind observe a
/// `Lagged` error and miss the overwritten events.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// The type tag of an engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "agent:started")]
    AgentStarted,
    #[serde(rename = "agent:message")]
    AgentMessage,
    #[serde(rename = "agent:completed")]
    AgentCompleted,
    #[serde(rename = "agent:error")]
    AgentError,
    #[serde(rename = "task:created")]
    TaskCreated,
    #[serde(rename = "task:assigned")]
    TaskAssigned,
    #[serde(rename = "task:status_changed")]
    TaskStatusChanged,
    #[serde(rename = "review:started")]
    ReviewStarted,
    #[serde(rename = "review:approved")]
    ReviewApproved,
    #[serde(rename = "review:rejected")]
    ReviewRejected,
    #[serde(rename = "project:started")]
    ProjectStarted,
    #[serde(rename = "project:completed")]
    ProjectCompleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentStarted => "agent:started",
            Self::AgentMessage => "agent:message",
            Self::AgentCompleted => "agent:completed",
            Self::AgentError => "agent:error",
            Self::TaskCreated => "task:created",
            Self::TaskAssigned => "task:assigned",
            Self::TaskStatusChanged => "task:status_changed",
            Self::ReviewStarted => "review:started",
            Self::ReviewApproved => "review:approved",
            Self::ReviewRejected => "review:rejected",
            Self::ProjectStarted => "project:started",
            Self::ProjectCompleted => "project:completed",
        };
        f.write_str(s)
    }
}

impl FromStr for EventKind {
    type Err = EventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent:started" => Ok(Self::AgentStarted),
            "agent:message" => Ok(Self::AgentMessage),
            "agent:completed" => Ok(Self::AgentCompleted),
            "agent:error" => Ok(Self::AgentError),
            "task:created" => Ok(Self::TaskCreated),
            "task:assigned" => Ok(Self::TaskAssigned),
            "task:status_changed" => Ok(Self::TaskStatusChanged),
            "review:started" => Ok(Self::ReviewStarted),
            "review:approved" => Ok(Self::ReviewApproved),
            "review:rejected" => Ok(Self::ReviewRejected),
            "project:started" => Ok(Self::ProjectStarted),
            "project:completed" => Ok(Self::ProjectCompleted),
            other => Err(EventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventKind`] string.
#[derive(Debug, Clone)]
pub struct EventKindParseError(pub String);

impl fmt::Display for EventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event kind: {:?}", self.0)
    }
}

impl std::error::Error for EventKindParseError {}

// ---------------------------------------------------------------------------
// Event record
// ---------------------------------------------------------------------------

/// A single observability event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "agentRole")]
    pub agent_role: String,
    pub timestamp: DateTime<Utc>,
    /// Short human-readable summary; always present.
    pub summary: String,
    /// Longer free-text detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Free-form payload map (commonly `taskId`, `branch`, `worktree`,
    /// `reason`, `artifacts`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl EngineEvent {
    /// Build an event stamped with the current time.
    pub fn new(
        kind: EventKind,
        agent_id: impl Into<String>,
        agent_role: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            agent_id: agent_id.into(),
            agent_role: agent_role.into(),
            timestamp: Utc::now(),
            summary: summary.into(),
            detail: None,
            data: None,
        }
    }

    /// Attach a free-text detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach a single key/value pair to the data map.
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Process-wide pub/sub channel for [`EngineEvent`]s.
///
/// Cloning the bus is cheap; all clones publish into the same channel.
/// Emission never blocks: if no subscriber is attached the event is
/// dropped silently (the bus is observability, not control flow).
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the default ring-buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with an explicit ring-buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to every current subscriber.
    pub fn emit(&self, event: EngineEvent) {
        tracing::debug!(kind = %event.kind, agent = %event.agent_id, summary = %event.summary, "event");
        // An error here only means there are no receivers right now.
        let _ = self.tx.send(event);
    }

    /// Subscribe to the wildcard feed: every event, in the order the bus
    /// observed it.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to a single event kind.
    pub fn subscribe_kind(&self, kind: EventKind) -> KindSubscription {
        KindSubscription {
            kind,
            rx: self.tx.subscribe(),
        }
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription filtered to one [`EventKind`].
#[derive(Debug)]
pub struct KindSubscription {
    kind: EventKind,
    rx: broadcast::Receiver<EngineEvent>,
}

impl KindSubscription {
    /// Receive the next event of the subscribed kind.
    ///
    /// Events of other kinds are skipped. Returns `None` once the bus is
    /// closed or this receiver lagged past the ring buffer.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.kind == self.kind => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(kind = %self.kind, skipped, "event subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
