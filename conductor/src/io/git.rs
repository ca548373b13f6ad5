//! Git adapter for conductor operations.
//!
//! The loop commits deterministically and reconciliation treats committed
//! history as ground truth, so we keep a small, explicit wrapper around `git`
//! subprocess calls: commits, worktrees, merges, and ancestry checks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// A merge hit conflicting changes. Surfaced, never auto-resolved: conflicts
/// require judgment. The merge is aborted before this is returned.
#[derive(Debug)]
pub struct MergeConflictError {
    pub branch: String,
}

impl fmt::Display for MergeConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merging '{}' hit conflicts (aborted)", self.branch)
    }
}

impl std::error::Error for MergeConflictError {}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Return the current HEAD short SHA (stable given repo state).
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// The repository's main-line branch: `main` if it exists, else `master`.
    pub fn detect_mainline(&self) -> Result<String> {
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(candidate.to_string());
            }
        }
        Err(anyhow!("no main-line branch found (expected main or master)"))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Check whether a commit-ish resolves to a commit in this repository.
    pub fn commit_exists(&self, commitish: &str) -> Result<bool> {
        let spec = format!("{commitish}^{{commit}}");
        let status = self
            .run(&["rev-parse", "--quiet", "--verify", &spec])?
            .status;
        Ok(status.success())
    }

    /// True when `ancestor` is an ancestor of (or equal to) `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(anyhow!(
                    "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                    stderr.trim()
                ))
            }
        }
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Create a worktree at `path` on a new branch forked from HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        debug!(path = %path.display(), branch, "adding worktree");
        let path_str = path_str(path)?;
        self.run_checked(&["worktree", "add", "-b", branch, path_str])?;
        Ok(())
    }

    /// Remove a worktree checkout. `force` discards uncommitted changes.
    #[instrument(skip_all)]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        debug!(path = %path.display(), force, "removing worktree");
        let path_str = path_str(path)?;
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str);
        self.run_checked(&args)?;
        Ok(())
    }

    /// Delete a local branch. `force` deletes even if unmerged.
    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, branch])?;
        Ok(())
    }

    /// Merge `branch` into the currently checked-out branch (fast-forward when
    /// possible). Conflicts abort the merge and surface a downcastable
    /// [`MergeConflictError`].
    #[instrument(skip_all, fields(branch))]
    pub fn merge_branch(&self, branch: &str) -> Result<()> {
        let output = self.run(&["merge", "--no-edit", branch])?;
        if output.status.success() {
            debug!(branch, "merge succeeded");
            return Ok(());
        }
        warn!(branch, "merge failed, aborting");
        let abort = self.run(&["merge", "--abort"])?;
        if !abort.status.success() {
            let stderr = String::from_utf8_lossy(&abort.stderr);
            warn!(stderr = %stderr.trim(), "merge --abort failed");
        }
        Err(MergeConflictError {
            branch: branch.to_string(),
        }
        .into())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-unicode path {}", path.display()))
}
