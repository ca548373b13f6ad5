//! Test-only helpers: temp git repositories and scripted collaborators.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{AgentConfig, ConductorConfig, VerifyConfig, write_config};
use crate::io::invoker::{AgentInvocationError, AgentInvoker, AgentTranscript, InvokeRequest};
use crate::io::layout::{ConductorPaths, StreamPaths};
use crate::io::lock::ProcessProbe;
use crate::io::verify::{Verifier, VerifyOutcome, VerifyRequest};
use crate::step::StepContext;
use crate::stream;

/// Probe whose answer never changes, regardless of pid.
pub struct AlwaysAlive;

impl ProcessProbe for AlwaysAlive {
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Probe that reports every pid dead (all locks stale).
pub struct NeverAlive;

impl ProcessProbe for NeverAlive {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

/// Loop-friendly config: no backoff sleeps, short timeouts, named agents.
pub fn test_config(agent_names: &[&str]) -> ConductorConfig {
    ConductorConfig {
        backoff_base_ms: 0,
        backoff_cap_ms: 0,
        agent_timeout_secs: 10,
        verify_timeout_secs: 10,
        verify: VerifyConfig {
            command: vec!["true".to_string()],
        },
        agents: agent_names
            .iter()
            .map(|name| AgentConfig {
                name: name.to_string(),
                command: vec![format!("{name}-binary")],
            })
            .collect(),
        ..ConductorConfig::default()
    }
}

/// A temp git repository with an initial commit on `main`.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path();

        run_git(root, &["-c", "init.defaultBranch=main", "init"])?;
        run_git(root, &["config", "user.email", "test@example.com"])?;
        run_git(root, &["config", "user.name", "test"])?;
        fs::write(root.join("README.md"), "hi\n").context("write README")?;
        run_git(root, &["add", "README.md"])?;
        run_git(root, &["commit", "-m", "chore: init"])?;

        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Create a stream seeded with `checklist` and install the test config.
    pub fn new_stream(&self, checklist: &str) -> Result<u32> {
        let stream_id = stream::new_stream(self.root(), Some(checklist))?;
        self.set_config(&test_config(&["primary"]))?;
        Ok(stream_id)
    }

    pub fn set_config(&self, config: &ConductorConfig) -> Result<()> {
        let paths = ConductorPaths::new(self.root());
        write_config(&paths.config_path, config)
    }

    /// Step context running against the main checkout with the test config.
    pub fn step_context(&self, stream_id: u32) -> StepContext {
        StepContext {
            paths: StreamPaths::new(self.root(), stream_id),
            workspace: stream::workspace_dir(self.root(), stream_id)
                .unwrap_or_else(|| self.root().to_path_buf()),
            config: test_config(&["primary"]),
            dry_run: false,
            cancel: crate::cancel::CancelToken::new(),
        }
    }
}

fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        return Err(anyhow!("git {} failed", args.join(" ")));
    }
    Ok(())
}

/// Invoker returning scripted transcripts instead of spawning processes.
///
/// Outputs are consumed front-to-back; the last one repeats forever, which
/// keeps fixed-budget loop tests short. Optionally touches a workspace file
/// on every call so commits have staged changes.
pub struct ScriptedInvoker {
    outputs: Mutex<Vec<String>>,
    error: Option<String>,
    touch: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn with_outputs(outputs: Vec<&str>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().map(str::to_string).collect()),
            error: None,
            touch: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every invocation with an `AgentInvocationError`.
    pub fn erroring(reason: &str) -> Self {
        Self {
            outputs: Mutex::new(Vec::new()),
            error: Some(reason.to_string()),
            touch: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Write `path` (workspace-relative) with fresh content on every call.
    pub fn touching(mut self, path: &str) -> Self {
        self.touch = Some(path.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn invoke(&self, request: &InvokeRequest) -> Result<AgentTranscript> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(reason) = &self.error {
            return Err(AgentInvocationError {
                agent: request.agent.name.clone(),
                reason: reason.clone(),
            }
            .into());
        }
        if let Some(rel) = &self.touch {
            fs::write(request.workspace.join(rel), format!("call {call}\n"))
                .context("touch workspace file")?;
        }
        fs::write(&request.log_path, "scripted agent\n").context("write agent log")?;

        let mut outputs = self.outputs.lock().expect("outputs lock");
        let text = if outputs.len() > 1 {
            outputs.remove(0)
        } else {
            outputs
                .first()
                .cloned()
                .ok_or_else(|| anyhow!("scripted invoker has no outputs"))?
        };
        Ok(AgentTranscript {
            text,
            cancelled: false,
        })
    }
}

/// Verifier returning scripted outcomes instead of running commands.
pub struct ScriptedVerifier {
    outcomes: Mutex<Vec<VerifyOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn with_outcomes(outcomes: Vec<VerifyOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every verification passes.
    pub fn passing() -> Self {
        Self::with_outcomes(vec![VerifyOutcome::Pass])
    }

    /// Every verification fails with the same output.
    pub fn failing(output: &str) -> Self {
        Self::with_outcomes(vec![VerifyOutcome::Fail {
            output: output.to_string(),
        }])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::write(&request.log_path, "scripted verify\n").context("write verify log")?;

        let mut outcomes = self.outcomes.lock().expect("outcomes lock");
        if outcomes.len() > 1 {
            return Ok(outcomes.remove(0));
        }
        outcomes
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("scripted verifier has no outcomes"))
    }
}
