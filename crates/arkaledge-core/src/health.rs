//! Per-agent health records with exponential cooldown.
//!
//! The scheduler consults this registry before assigning work: an agent
//! marked `down` is non-schedulable until its cooldown elapses and a
//! recovery probe succeeds.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Cooldown base: first failure backs off 30 s.
const COOLDOWN_BASE_SECS: i64 = 30;

/// Cooldown ceiling: 10 minutes.
const COOLDOWN_MAX_SECS: i64 = 600;

/// Health state of an agent backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Down,
}

/// One agent's record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthRecord {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub reason: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Set while a probe is in flight so a tick does not double-probe.
    #[serde(skip)]
    pub pending_probe: bool,
}

impl Default for AgentHealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            consecutive_failures: 0,
            reason: None,
            cooldown_until: None,
            pending_probe: false,
        }
    }
}

/// Registry of agent health records.
///
/// Interior mutability: the scheduler and completion callbacks both mark
/// records, so the map sits behind a mutex.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    records: Mutex<HashMap<String, AgentHealthRecord>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A probe or a real run succeeded.
    pub fn mark_healthy(&self, agent_id: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(agent_id.to_owned()).or_default();
        record.status = HealthStatus::Healthy;
        record.last_check = Some(Utc::now());
        record.consecutive_failures = 0;
        record.reason = None;
        record.cooldown_until = None;
        record.pending_probe = false;
    }

    /// A health probe failed.
    pub fn mark_probe_failure(&self, agent_id: &str, reason: &str) {
        self.mark_down(agent_id, reason);
    }

    /// A runtime crashed mid-task.
    pub fn mark_runtime_crash(&self, agent_id: &str, reason: &str) {
        self.mark_down(agent_id, reason);
    }

    fn mark_down(&self, agent_id: &str, reason: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(agent_id.to_owned()).or_default();
        record.status = HealthStatus::Down;
        record.last_check = Some(Utc::now());
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.reason = Some(reason.to_owned());
        record.cooldown_until = Some(Utc::now() + cooldown(record.consecutive_failures));
        record.pending_probe = false;
        tracing::warn!(
            agent = agent_id,
            failures = record.consecutive_failures,
            reason,
            "agent marked down"
        );
    }

    /// Whether the scheduler may hand this agent work right now.
    pub fn is_schedulable(&self, agent_id: &str) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(agent_id)
            .map(|r| r.status != HealthStatus::Down)
            .unwrap_or(true)
    }

    /// Whether a probe should be dispatched for this agent.
    ///
    /// `unknown` agents are always probed once; `down` agents only after
    /// their cooldown has elapsed. A probe already in flight suppresses
    /// further probes.
    pub fn should_probe(&self, agent_id: &str) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get(agent_id) {
            None => true,
            Some(r) if r.pending_probe => false,
            Some(r) => match r.status {
                HealthStatus::Unknown => true,
                HealthStatus::Healthy => false,
                HealthStatus::Down => r
                    .cooldown_until
                    .map(|until| Utc::now() >= until)
                    .unwrap_or(true),
            },
        }
    }

    /// Record that a probe is in flight.
    pub fn mark_pending_probe(&self, agent_id: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.entry(agent_id.to_owned()).or_default().pending_probe = true;
    }

    /// Snapshot one record (for observability and tests).
    pub fn record(&self, agent_id: &str) -> AgentHealthRecord {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(agent_id).cloned().unwrap_or_default()
    }
}

/// Exponential cooldown: `min(base * 2^(failures-1), max)`.
fn cooldown(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let secs = COOLDOWN_BASE_SECS.saturating_mul(1i64 << exponent);
    Duration::seconds(secs.min(COOLDOWN_MAX_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_agent_is_schedulable_and_probed() {
        let registry = HealthRegistry::new();
        assert!(registry.is_schedulable("e1"));
        assert!(registry.should_probe("e1"));
    }

    #[test]
    fn healthy_agent_is_not_probed() {
        let registry = HealthRegistry::new();
        registry.mark_healthy("e1");
        assert!(registry.is_schedulable("e1"));
        assert!(!registry.should_probe("e1"));
    }

    #[test]
    fn down_agent_is_not_schedulable_until_cooldown() {
        let registry = HealthRegistry::new();
        registry.mark_probe_failure("e1", "rate limit");

        assert!(!registry.is_schedulable("e1"));
        // Cooldown of 30s has not elapsed.
        assert!(!registry.should_probe("e1"));

        let record = registry.record("e1");
        assert_eq!(record.status, HealthStatus::Down);
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.reason.as_deref(), Some("rate limit"));
    }

    #[test]
    fn cooldown_doubles_and_caps() {
        assert_eq!(cooldown(1), Duration::seconds(30));
        assert_eq!(cooldown(2), Duration::seconds(60));
        assert_eq!(cooldown(3), Duration::seconds(120));
        assert_eq!(cooldown(5), Duration::seconds(480));
        // 30 * 2^5 = 960 > 600 cap.
        assert_eq!(cooldown(6), Duration::seconds(600));
        assert_eq!(cooldown(30), Duration::seconds(600));
    }

    #[test]
    fn recovery_probe_allowed_after_cooldown() {
        let registry = HealthRegistry::new();
        registry.mark_runtime_crash("e1", "stream died");

        // Force the cooldown into the past.
        {
            let mut records = registry.records.lock().unwrap();
            records.get_mut("e1").unwrap().cooldown_until =
                Some(Utc::now() - Duration::seconds(1));
        }
        assert!(registry.should_probe("e1"));

        registry.mark_healthy("e1");
        assert!(registry.is_schedulable("e1"));
        assert_eq!(registry.record("e1").consecutive_failures, 0);
    }

    #[test]
    fn pending_probe_suppresses_duplicates() {
        let registry = HealthRegistry::new();
        assert!(registry.should_probe("e1"));
        registry.mark_pending_probe("e1");
        assert!(!registry.should_probe("e1"));

        // Probe outcome clears the pending flag either way.
        registry.mark_probe_failure("e1", "unauthorized");
        assert!(!registry.record("e1").pending_probe);
    }

    #[test]
    fn failures_accumulate() {
        let registry = HealthRegistry::new();
        registry.mark_probe_failure("e1", "one");
        registry.mark_probe_failure("e1", "two");
        let record = registry.record("e1");
        assert_eq!(record.consecutive_failures, 2);
        assert_eq!(record.reason.as_deref(), Some("two"));
    }
}
