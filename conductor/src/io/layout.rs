//! Canonical paths for `.conductor/` state.
//!
//! All conductor-owned state lives under `.conductor/` at the parent
//! repository root, even when a stream executes in a worktree: the workspace
//! receives agent edits and commits, the state directory receives
//! bookkeeping. `.conductor/.gitignore` contains `*`, so none of this is ever
//! committed, and committed history stays the sole ground truth for
//! reconciliation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Repository-level conductor paths.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub locks_dir: PathBuf,
    pub streams_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(".conductor");
        Self {
            gitignore_path: conductor_dir.join(".gitignore"),
            config_path: conductor_dir.join("config.toml"),
            locks_dir: conductor_dir.join("locks"),
            streams_dir: conductor_dir.join("streams"),
            worktrees_dir: conductor_dir.join("worktrees"),
            conductor_dir,
            root,
        }
    }
}

/// Per-stream state paths.
#[derive(Debug, Clone)]
pub struct StreamPaths {
    pub stream_id: u32,
    pub dir: PathBuf,
    pub checklist_path: PathBuf,
    pub ledger_path: PathBuf,
    pub errors_path: PathBuf,
    pub completed_marker: PathBuf,
    pub merged_marker: PathBuf,
    pub iterations_dir: PathBuf,
    pub worktree_dir: PathBuf,
}

impl StreamPaths {
    pub fn new(root: &Path, stream_id: u32) -> Self {
        let conductor = ConductorPaths::new(root);
        let dir = conductor.streams_dir.join(stream_id.to_string());
        Self {
            stream_id,
            checklist_path: dir.join("checklist.md"),
            ledger_path: dir.join("ledger.json"),
            errors_path: dir.join("errors.json"),
            completed_marker: dir.join(".completed"),
            merged_marker: dir.join(".merged"),
            iterations_dir: dir.join("iterations"),
            worktree_dir: conductor.worktrees_dir.join(stream_id.to_string()),
            dir,
        }
    }

    /// Directory for one iteration's artifacts (prompt, agent log, verify log).
    pub fn iteration_dir(&self, seq: u64) -> PathBuf {
        self.iterations_dir.join(seq.to_string())
    }

    /// The stream's dedicated branch name.
    pub fn branch(&self) -> String {
        format!("conductor/stream-{}", self.stream_id)
    }
}

/// Create a presence-only marker file. Idempotent.
pub fn write_marker(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, "").with_context(|| format!("write marker {}", path.display()))
}

/// Numeric stream ids present under `.conductor/streams/`, ascending.
pub fn stream_ids(root: &Path) -> Result<Vec<u32>> {
    let streams_dir = ConductorPaths::new(root).streams_dir;
    if !streams_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    let entries = fs::read_dir(&streams_dir)
        .with_context(|| format!("read {}", streams_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", streams_dir.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
