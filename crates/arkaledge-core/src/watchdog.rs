//! Bounded consumption of backend streams.
//!
//! Two deadlines guard every consumed stream: **idle** (no message within
//! the idle window) and **total** (elapsed wall time since consumption
//! started). Both fire as a typed [`WatchdogTimeout`] so callers can abort
//! the runtime and record which limit tripped. Timers are owned by the
//! consuming future, so nothing leaks when it is dropped.

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;

use crate::runtime::{AgentMessage, MessageStream};

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    Idle,
    Total,
}

impl fmt::Display for WatchdogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Total => f.write_str("total"),
        }
    }
}

/// A watchdog deadline fired while consuming a backend stream.
#[derive(Debug, Error)]
#[error("agent stream {kind} timeout after {timeout_ms} ms")]
pub struct WatchdogTimeout {
    pub kind: WatchdogKind,
    pub timeout_ms: u64,
}

/// Idle and total limits for one consumption.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogLimits {
    pub idle: Duration,
    pub total: Duration,
}

impl WatchdogLimits {
    pub const fn new(idle: Duration, total: Duration) -> Self {
        Self { idle, total }
    }

    /// Reviewer limits: idle 120 s, total 600 s.
    pub const fn review() -> Self {
        Self::new(Duration::from_secs(120), Duration::from_secs(600))
    }

    /// Health-probe limits: idle 25 s, total 40 s.
    pub const fn probe() -> Self {
        Self::new(Duration::from_secs(25), Duration::from_secs(40))
    }
}

/// Consume a stream to completion under the given limits.
///
/// `on_message` observes every message as it arrives (for event
/// forwarding); the full sequence is returned at the end. On a deadline,
/// the stream is dropped and the typed timeout returned -- the caller is
/// responsible for aborting the runtime.
pub async fn consume_stream(
    mut stream: MessageStream,
    limits: WatchdogLimits,
    mut on_message: impl FnMut(&AgentMessage),
) -> Result<Vec<AgentMessage>, WatchdogTimeout> {
    let deadline = tokio::time::Instant::now() + limits.total;
    let mut messages = Vec::new();

    loop {
        let next = tokio::time::timeout_at(
            deadline,
            tokio::time::timeout(limits.idle, stream.next()),
        )
        .await;

        match next {
            Err(_) => {
                return Err(WatchdogTimeout {
                    kind: WatchdogKind::Total,
                    timeout_ms: limits.total.as_millis() as u64,
                });
            }
            Ok(Err(_)) => {
                return Err(WatchdogTimeout {
                    kind: WatchdogKind::Idle,
                    timeout_ms: limits.idle.as_millis() as u64,
                });
            }
            Ok(Ok(None)) => return Ok(messages),
            Ok(Ok(Some(message))) => {
                on_message(&message);
                messages.push(message);
            }
        }
    }
}
