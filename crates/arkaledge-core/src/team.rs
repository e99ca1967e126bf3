//! Team and workflow configuration: who the agents are and how the board
//! is run. Parsing from TOML happens in the CLI; these are the typed
//! declarations the engine consumes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role of an agent within the team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    ProductManager,
    ScrumMaster,
    Engineer,
    Reviewer,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProductManager => "product-manager",
            Self::ScrumMaster => "scrum-master",
            Self::Engineer => "engineer",
            Self::Reviewer => "reviewer",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRole {
    type Err = AgentRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product-manager" => Ok(Self::ProductManager),
            "scrum-master" => Ok(Self::ScrumMaster),
            "engineer" => Ok(Self::Engineer),
            "reviewer" => Ok(Self::Reviewer),
            other => Err(AgentRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRole`] string.
#[derive(Debug, Clone)]
pub struct AgentRoleParseError(pub String);

impl fmt::Display for AgentRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent role: {:?}", self.0)
    }
}

impl std::error::Error for AgentRoleParseError {}

/// One agent declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub role: AgentRole,
    /// Backend SDK tag (e.g. "claude-code", "codex").
    pub backend: String,
    /// Model name the backend should use.
    pub model: String,
    /// Tool allow-list forwarded to the backend.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Workflow tuning for the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub review_required: bool,
    #[serde(default = "default_true")]
    pub auto_merge: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            columns: default_columns(),
            max_retries: default_max_retries(),
            review_required: true,
            auto_merge: true,
        }
    }
}

fn default_columns() -> Vec<String> {
    ["backlog", "in_progress", "review", "done", "blocked"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// The full invocation configuration: team roster plus workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl TeamConfig {
    /// Look up an agent by id.
    pub fn agent(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// All agents that implement tasks.
    pub fn engineers(&self) -> Vec<&AgentSpec> {
        self.agents
            .iter()
            .filter(|a| matches!(a.role, AgentRole::Engineer | AgentRole::Reviewer))
            .collect()
    }

    /// The agent that plans (first product-manager, else the first agent).
    pub fn planner(&self) -> Option<&AgentSpec> {
        self.agents
            .iter()
            .find(|a| a.role == AgentRole::ProductManager)
            .or_else(|| self.agents.first())
    }

    /// The identity the scheduler acts as (first scrum-master, else a
    /// fixed fallback id).
    pub fn scrum_master_id(&self) -> &str {
        self.agents
            .iter()
            .find(|a| a.role == AgentRole::ScrumMaster)
            .map(|a| a.id.as_str())
            .unwrap_or("scrum-master")
    }
}
