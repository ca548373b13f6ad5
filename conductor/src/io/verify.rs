//! Verification command runner.
//!
//! An externally supplied shell command, run with the workspace as current
//! directory. Exit code zero is the only success signal; all output is
//! captured for the error window on failure. Timeout is a failure, not a
//! crash of the loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::io::process::run_command_with_timeout;

/// Parameters for one verification run.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workspace: PathBuf,
    /// Path to write the captured verification log.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: CancelToken,
}

/// Result of a verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Pass,
    /// Verification failed; `output` carries the captured text for the error
    /// window.
    Fail { output: String },
    /// The run was killed by cancellation before producing a verdict.
    Cancelled,
}

/// Abstraction over verification backends, scripted in tests.
pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome>;
}

/// Verifier that runs a configured argv (e.g. `just ci`).
pub struct ShellVerifier {
    command: Vec<String>,
}

impl ShellVerifier {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Verifier for ShellVerifier {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("verify command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]).current_dir(&request.workspace);

        let output = run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
            &request.cancel,
        )
        .context("run verify command")?;

        let text = output.combined_text();
        write_verify_log(&request.log_path, &text, output.timed_out)?;

        if output.cancelled {
            return Ok(VerifyOutcome::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "verification timed out");
            return Ok(VerifyOutcome::Fail {
                output: format!("verification timed out after {:?}", request.timeout),
            });
        }
        if output.status.success() {
            debug!("verification passed");
            return Ok(VerifyOutcome::Pass);
        }
        debug!(exit_code = ?output.status.code(), "verification failed");
        Ok(VerifyOutcome::Fail { output: text })
    }
}

fn write_verify_log(path: &Path, text: &str, timed_out: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    let mut buf = text.to_string();
    if timed_out {
        buf.push_str("\n[verification timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write verify log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(temp: &Path) -> VerifyRequest {
        VerifyRequest {
            workspace: temp.to_path_buf(),
            log_path: temp.join("verify.log"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            cancel: CancelToken::new(),
        }
    }

    fn sh(script: &str) -> ShellVerifier {
        ShellVerifier::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn exit_zero_is_the_only_success_signal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = sh("exit 0").verify(&request(temp.path())).expect("verify");
        assert_eq!(outcome, VerifyOutcome::Pass);
    }

    #[test]
    fn failure_carries_captured_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = sh("echo broken assertion >&2; exit 1")
            .verify(&request(temp.path()))
            .expect("verify");
        match outcome {
            VerifyOutcome::Fail { output } => assert!(output.contains("broken assertion")),
            other => panic!("expected failure, got {other:?}"),
        }
        let log = fs::read_to_string(temp.path().join("verify.log")).expect("read log");
        assert!(log.contains("broken assertion"));
    }

    #[test]
    fn timeout_is_a_failure_with_explanation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path());
        req.timeout = Duration::from_millis(100);
        let outcome = sh("sleep 30").verify(&req).expect("verify");
        match outcome {
            VerifyOutcome::Fail { output } => assert!(output.contains("timed out")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
