//! Agent invocation boundary.
//!
//! The [`AgentInvoker`] trait decouples the loop from the actual agent
//! backend: the real invoker spawns whatever argv the fallback chain names,
//! feeds the composed instruction on stdin, and captures output; tests use
//! scripted invokers that return predetermined transcripts without spawning
//! processes. The agent contract is opaque: it writes its work directly into
//! the workspace and may emit one completion sentinel in its output stream.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::io::config::AgentConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Working directory for the agent process (the stream's workspace).
    pub workspace: PathBuf,
    /// Composed instruction, fed on stdin.
    pub prompt: String,
    /// Agent from the fallback chain to run.
    pub agent: AgentConfig,
    /// Path to write the captured agent output log.
    pub log_path: PathBuf,
    /// Maximum time to wait for the agent to finish.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Observed during the blocking wait; cancellation kills the agent.
    pub cancel: CancelToken,
}

/// Captured output of one completed agent invocation.
#[derive(Debug, Clone)]
pub struct AgentTranscript {
    /// Bounded combined stdout+stderr text, scanned for sentinels.
    pub text: String,
    /// True when the invocation was killed by cancellation.
    pub cancelled: bool,
}

/// The agent process failed to start or timed out. Retried per backoff
/// policy; never a crash of the loop.
#[derive(Debug)]
pub struct AgentInvocationError {
    pub agent: String,
    pub reason: String,
}

impl fmt::Display for AgentInvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent '{}' invocation failed: {}", self.agent, self.reason)
    }
}

impl std::error::Error for AgentInvocationError {}

/// Abstraction over agent execution backends.
pub trait AgentInvoker {
    /// Run the agent and return its captured transcript.
    fn invoke(&self, request: &InvokeRequest) -> Result<AgentTranscript>;
}

/// Invoker that spawns the configured agent argv as a child process.
pub struct CommandInvoker;

impl AgentInvoker for CommandInvoker {
    #[instrument(skip_all, fields(agent = %request.agent.name, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &InvokeRequest) -> Result<AgentTranscript> {
        info!(workspace = %request.workspace.display(), "starting agent");

        let argv = &request.agent.command;
        let program = argv
            .first()
            .ok_or_else(|| anyhow!("agent '{}' has an empty command", request.agent.name))?;
        let mut cmd = Command::new(program);
        cmd.args(&argv[1..]).current_dir(&request.workspace);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            &request.cancel,
        )
        .map_err(|err| {
            anyhow::Error::new(AgentInvocationError {
                agent: request.agent.name.clone(),
                reason: format!("{err:#}"),
            })
        })?;

        write_agent_log(&request.log_path, &output)?;

        if output.cancelled {
            return Ok(AgentTranscript {
                text: output.combined_text(),
                cancelled: true,
            });
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(AgentInvocationError {
                agent: request.agent.name.clone(),
                reason: format!("timed out after {:?}", request.timeout),
            }
            .into());
        }
        if !output.status.success() {
            // A nonzero agent exit is not fatal: the transcript may still
            // carry a sentinel, and verification decides the iteration.
            warn!(exit_code = ?output.status.code(), "agent exited nonzero");
        }

        debug!("agent finished");
        Ok(AgentTranscript {
            text: output.combined_text(),
            cancelled: false,
        })
    }
}

fn write_agent_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    if output.stdout_truncated > 0 {
        buf.push_str(&format!(
            "\n[agent stdout truncated {} bytes]\n",
            output.stdout_truncated
        ));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stderr_truncated > 0 {
        buf.push_str(&format!(
            "\n[agent stderr truncated {} bytes]\n",
            output.stderr_truncated
        ));
    }
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    if output.cancelled {
        buf.push_str("\n[agent cancelled]\n");
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}
