//! Core orchestration engine: drives a team of LLM agent runtimes through
//! plan, implement, review and merge cycles on a git-backed kanban.
//!
//! Layering, leaf to root: [`worktree`] and [`context`] own the project
//! directory; [`runtime`], [`watchdog`] and [`health`] own backend
//! interaction; [`roles`] implement planner/executor/reviewer behavior;
//! [`scheduler`] and [`failure`] drive the loop; [`orchestrator`] wires a
//! run together and [`http`] exposes it read-only.

pub mod context;
pub mod failure;
pub mod health;
pub mod http;
pub mod orchestrator;
pub mod roles;
pub mod runtime;
pub mod scheduler;
pub mod team;
pub mod watchdog;
pub mod worktree;

pub use orchestrator::{EngineOptions, OrchestrationOutcome, Orchestrator};
pub use runtime::{AgentMessage, AgentRuntime, MessageKind, MessageStream, RunOptions};
pub use scheduler::{ScheduleResult, SchedulerConfig};
pub use team::{AgentRole, AgentSpec, TeamConfig, WorkflowConfig};
