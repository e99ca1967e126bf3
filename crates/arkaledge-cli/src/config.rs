//! Configuration file management.
//!
//! The team file is TOML: agent roster, workflow tuning, and the backend
//! command table the CLI uses to build runtimes. Resolution chain:
//! CLI flag > `ARKALEDGE_CONFIG` env var > `<projectDir>/arkaledge.toml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use arkaledge_core::TeamConfig;

/// How to launch one backend's agent process.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The full on-disk configuration.
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(flatten)]
    pub team: TeamConfig,
    /// Backend tag -> launch command.
    #[serde(default)]
    pub backends: HashMap<String, BackendCommand>,
}

/// Resolve the config path from flag, env var, or project-dir default.
pub fn resolve_config_path(flag: Option<PathBuf>, project_dir: &Path) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Ok(env_path) = std::env::var("ARKALEDGE_CONFIG") {
        return PathBuf::from(env_path);
    }
    project_dir.join("arkaledge.toml")
}

/// Load and validate the config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile =
        toml::from_str(&contents).context("failed to parse config file")?;

    if config.team.agents.is_empty() {
        bail!("config declares no agents");
    }
    for agent in &config.team.agents {
        if !config.backends.contains_key(&agent.backend) {
            bail!(
                "agent {} uses backend {:?} but no [backends.{}] command is configured",
                agent.id,
                agent.backend,
                agent.backend
            );
        }
    }
    Ok(config)
}
