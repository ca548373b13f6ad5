//! Conductor configuration stored under `.conductor/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Conductor configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Main-line branch name. Empty means auto-detect (`main`, then `master`).
    pub mainline: String,

    /// Default iteration budget for `conductor build`.
    pub max_iterations: u32,

    /// Consecutive failures on one agent before switching to the next in the
    /// fallback chain.
    pub switch_threshold: u32,

    /// Wall-clock budget for one agent invocation, in seconds.
    pub agent_timeout_secs: u64,

    /// Wall-clock budget for the verification command, in seconds.
    pub verify_timeout_secs: u64,

    /// Truncate captured agent output beyond this many bytes.
    pub agent_output_limit_bytes: usize,

    /// Truncate captured verification output beyond this many bytes.
    pub verify_output_limit_bytes: usize,

    /// Base delay before retrying after a failed iteration, in milliseconds.
    pub backoff_base_ms: u64,

    /// Upper bound on the exponential retry delay, in milliseconds.
    pub backoff_cap_ms: u64,

    pub verify: VerifyConfig,

    /// Fallback chain, tried in order. The first entry is the primary agent.
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Command to run after each iteration (e.g. `["just","ci"]`). Exit code
    /// zero is the only success signal.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AgentConfig {
    pub name: String,
    /// Argv of the agent process. The composed instruction is fed on stdin.
    pub command: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "ci".to_string()],
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            mainline: String::new(),
            max_iterations: 25,
            switch_threshold: 3,
            agent_timeout_secs: 30 * 60,
            verify_timeout_secs: 15 * 60,
            agent_output_limit_bytes: 200_000,
            verify_output_limit_bytes: 200_000,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 60_000,
            verify: VerifyConfig::default(),
            agents: vec![AgentConfig {
                name: "codex".to_string(),
                command: vec![
                    "codex".to_string(),
                    "exec".to_string(),
                    "--skip-git-repo-check".to_string(),
                    "-".to_string(),
                ],
            }],
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.switch_threshold == 0 {
            return Err(anyhow!("switch_threshold must be > 0"));
        }
        if self.agent_timeout_secs == 0 || self.verify_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 || self.verify_output_limit_bytes == 0 {
            return Err(anyhow!("output limits must be > 0"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(anyhow!("backoff_cap_ms must be >= backoff_base_ms"));
        }
        if self.verify.command.is_empty() || self.verify.command[0].trim().is_empty() {
            return Err(anyhow!("verify.command must be a non-empty array"));
        }
        if self.agents.is_empty() {
            return Err(anyhow!("agents must list at least one agent"));
        }
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(anyhow!("agent name must not be empty"));
            }
            if agent.command.is_empty() || agent.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "agent '{}' command must be a non-empty array",
                    agent.name
                ));
            }
        }
        let mut names: Vec<&str> = self.agents.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.agents.len() {
            return Err(anyhow!("agent names must be distinct"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
