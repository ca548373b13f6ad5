//! Stream lifecycle: creation, isolated workspaces, merge, cleanup.
//!
//! A stream is one independently-schedulable unit of work: a checklist plus
//! its own lock, ledger, and error window, optionally bound to an isolated
//! worktree on a dedicated branch. Streams are created explicitly, merged
//! explicitly, and destroyed explicitly; the loop itself never creates or
//! removes them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::checklist::Checklist;
use crate::core::status::DerivedStatus;
use crate::io::config::{ConductorConfig, load_config, write_config};
use crate::io::git::Git;
use crate::io::layout::{ConductorPaths, StreamPaths, stream_ids, write_marker};
use crate::io::lock::ProcessProbe;
use crate::reconcile;

/// Everything under `.conductor/` is bookkeeping, never committed.
const CONDUCTOR_GITIGNORE: &str = "*\n";

const CHECKLIST_PLACEHOLDER: &str = "\
# Checklist

- [ ] Describe the first story
  - [ ] list its acceptance criteria
";

/// Ensure `.conductor/` scaffolding exists. Idempotent.
pub fn init_conductor(root: &Path) -> Result<ConductorPaths> {
    let paths = ConductorPaths::new(root);
    for dir in [
        &paths.conductor_dir,
        &paths.locks_dir,
        &paths.streams_dir,
        &paths.worktrees_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, CONDUCTOR_GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }
    if !paths.config_path.exists() {
        write_config(&paths.config_path, &ConductorConfig::default())?;
    }
    Ok(paths)
}

/// Allocate the next unused stream id and scaffold its state directory.
///
/// Ids are numeric, monotonically increasing (max existing + 1), never reused
/// and never overwritten. `checklist` seeds the stream's checklist; when
/// `None` a placeholder is written.
#[instrument(skip_all)]
pub fn new_stream(root: &Path, checklist: Option<&str>) -> Result<u32> {
    init_conductor(root)?;

    let text = checklist.unwrap_or(CHECKLIST_PLACEHOLDER);
    Checklist::parse(text).context("seed checklist")?;

    let stream_id = stream_ids(root)?.last().copied().unwrap_or(0) + 1;
    let paths = StreamPaths::new(root, stream_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create stream dir {}", paths.dir.display()))?;
    fs::write(&paths.checklist_path, text)
        .with_context(|| format!("write {}", paths.checklist_path.display()))?;

    info!(stream_id, "stream created");
    Ok(stream_id)
}

/// Create the stream's isolated workspace: a worktree on a dedicated branch.
///
/// Optional: a stream without one runs directly against the main checkout,
/// `merge` is a no-op for it, and completion is detected purely via the
/// completed-path reconciliation.
#[instrument(skip_all, fields(stream_id))]
pub fn init_workspace(root: &Path, stream_id: u32) -> Result<PathBuf> {
    let paths = StreamPaths::new(root, stream_id);
    if !paths.dir.is_dir() {
        return Err(anyhow!("stream {stream_id} does not exist (run `conductor new`)"));
    }
    if paths.worktree_dir.exists() {
        return Err(anyhow!(
            "workspace already exists at {}",
            paths.worktree_dir.display()
        ));
    }

    let git = Git::new(root);
    let branch = paths.branch();
    if git.branch_exists(&branch)? {
        return Err(anyhow!("branch '{branch}' already exists"));
    }
    fs::create_dir_all(
        paths
            .worktree_dir
            .parent()
            .ok_or_else(|| anyhow!("worktree path has no parent"))?,
    )
    .context("create worktrees dir")?;
    git.worktree_add(&paths.worktree_dir, &branch)?;

    info!(stream_id, branch = %branch, "workspace created");
    Ok(paths.worktree_dir)
}

/// The stream's workspace directory, when one was initialized.
pub fn workspace_dir(root: &Path, stream_id: u32) -> Option<PathBuf> {
    let paths = StreamPaths::new(root, stream_id);
    paths.worktree_dir.is_dir().then_some(paths.worktree_dir)
}

/// Merge the stream's branch into the main line and write the `.merged`
/// marker.
///
/// Returns `false` for workspace-less streams (nothing to merge). Conflicts
/// surface as a downcastable `MergeConflictError`; they are never
/// auto-resolved. Refuses while the stream is running.
#[instrument(skip_all, fields(stream_id))]
pub fn merge_stream<P: ProcessProbe>(root: &Path, stream_id: u32, probe: &P) -> Result<bool> {
    let paths = StreamPaths::new(root, stream_id);
    if !paths.dir.is_dir() {
        return Err(anyhow!("stream {stream_id} does not exist"));
    }
    ensure_not_running(root, stream_id, probe)?;

    let git = Git::new(root);
    let branch = paths.branch();
    if !git.branch_exists(&branch)? {
        debug!(stream_id, "no branch, merge is a no-op");
        return Ok(false);
    }

    let current = git.current_branch()?;
    let mainline = mainline_branch(root, &git)?;
    if current != mainline {
        return Err(anyhow!(
            "must be on '{mainline}' to merge (currently on '{current}')"
        ));
    }

    git.merge_branch(&branch)?;
    write_marker(&paths.merged_marker)?;
    info!(stream_id, branch = %branch, "stream merged");
    Ok(true)
}

/// Remove the stream's isolated workspace and branch.
///
/// Never while running; otherwise only after the stream reconciles as merged,
/// or when `abandon` is passed explicitly. The stream's state directory
/// (ledger, checklist, markers) is retained as history.
#[instrument(skip_all, fields(stream_id, abandon))]
pub fn cleanup_stream<P: ProcessProbe>(
    root: &Path,
    stream_id: u32,
    abandon: bool,
    probe: &P,
) -> Result<()> {
    let paths = StreamPaths::new(root, stream_id);
    if !paths.dir.is_dir() {
        return Err(anyhow!("stream {stream_id} does not exist"));
    }
    ensure_not_running(root, stream_id, probe)?;

    if !abandon {
        let status = reconcile::status(root, stream_id, probe)?;
        if status != DerivedStatus::Merged {
            return Err(anyhow!(
                "stream {stream_id} is {} (merge it first, or pass --abandon)",
                status.as_str()
            ));
        }
    }

    let git = Git::new(root);
    if paths.worktree_dir.is_dir() {
        git.worktree_remove(&paths.worktree_dir, abandon)?;
    }
    let branch = paths.branch();
    if git.branch_exists(&branch)? {
        git.delete_branch(&branch, abandon)?;
    }

    info!(stream_id, "workspace cleaned up");
    Ok(())
}

fn ensure_not_running<P: ProcessProbe>(root: &Path, stream_id: u32, probe: &P) -> Result<()> {
    let conductor = ConductorPaths::new(root);
    let lock_manager = crate::io::lock::LockManager::new(&conductor.locks_dir, probe);
    if lock_manager.is_held_by_live_process(stream_id)? {
        return Err(anyhow!("stream {stream_id} is running"));
    }
    Ok(())
}

fn mainline_branch(root: &Path, git: &Git) -> Result<String> {
    let conductor = ConductorPaths::new(root);
    let config = load_config(&conductor.config_path)?;
    if config.mainline.is_empty() {
        git.detect_mainline()
    } else {
        Ok(config.mainline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NeverAlive, TestRepo};

    #[test]
    fn new_stream_allocates_monotonic_ids() {
        let repo = TestRepo::new().expect("repo");
        let root = repo.root();

        assert_eq!(new_stream(root, None).expect("first"), 1);
        assert_eq!(new_stream(root, None).expect("second"), 2);

        // Gaps below the maximum are never reused.
        fs::remove_dir_all(StreamPaths::new(root, 1).dir).expect("remove");
        assert_eq!(new_stream(root, None).expect("third"), 3);
        let paths = ConductorPaths::new(root);
        assert!(paths.config_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            "*\n"
        );
    }

    #[test]
    fn new_stream_rejects_invalid_checklist() {
        let repo = TestRepo::new().expect("repo");
        let err = new_stream(repo.root(), Some("no stories here\n")).unwrap_err();
        assert!(format!("{err:#}").contains("no story lines"));
    }

    #[test]
    fn init_workspace_creates_worktree_on_stream_branch() {
        let repo = TestRepo::new().expect("repo");
        let root = repo.root();
        let stream_id = new_stream(root, None).expect("stream");

        let workspace = init_workspace(root, stream_id).expect("workspace");
        assert!(workspace.join(".git").exists());
        assert_eq!(workspace_dir(root, stream_id), Some(workspace.clone()));

        let git = Git::new(&workspace);
        assert_eq!(
            git.current_branch().expect("branch"),
            format!("conductor/stream-{stream_id}")
        );

        let err = init_workspace(root, stream_id).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn merge_is_a_no_op_without_a_workspace() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = new_stream(repo.root(), None).expect("stream");
        let merged = merge_stream(repo.root(), stream_id, &NeverAlive).expect("merge");
        assert!(!merged);
    }

    #[test]
    fn merge_writes_marker_and_lands_commits() {
        let repo = TestRepo::new().expect("repo");
        let root = repo.root();
        let stream_id = new_stream(root, None).expect("stream");
        let workspace = init_workspace(root, stream_id).expect("workspace");

        fs::write(workspace.join("feature.txt"), "work\n").expect("write");
        let wt_git = Git::new(&workspace);
        wt_git.add_all().expect("add");
        assert!(wt_git.commit_staged("feat: stream work").expect("commit"));

        assert!(merge_stream(root, stream_id, &NeverAlive).expect("merge"));
        assert!(StreamPaths::new(root, stream_id).merged_marker.is_file());
        assert!(root.join("feature.txt").is_file());
    }

    #[test]
    fn cleanup_refuses_unmerged_stream_without_abandon() {
        let repo = TestRepo::new().expect("repo");
        let root = repo.root();
        let stream_id = new_stream(root, None).expect("stream");
        init_workspace(root, stream_id).expect("workspace");

        let err = cleanup_stream(root, stream_id, false, &NeverAlive).unwrap_err();
        assert!(err.to_string().contains("--abandon"));

        cleanup_stream(root, stream_id, true, &NeverAlive).expect("abandon");
        assert!(workspace_dir(root, stream_id).is_none());
        let git = Git::new(root);
        assert!(
            !git.branch_exists(&format!("conductor/stream-{stream_id}"))
                .expect("exists")
        );
    }

    #[test]
    fn cleanup_after_merge_removes_workspace_and_branch() {
        let repo = TestRepo::new().expect("repo");
        let root = repo.root();
        let stream_id = new_stream(root, None).expect("stream");
        let workspace = init_workspace(root, stream_id).expect("workspace");

        fs::write(workspace.join("done.txt"), "work\n").expect("write");
        let wt_git = Git::new(&workspace);
        wt_git.add_all().expect("add");
        assert!(wt_git.commit_staged("feat: done").expect("commit"));

        assert!(merge_stream(root, stream_id, &NeverAlive).expect("merge"));
        cleanup_stream(root, stream_id, false, &NeverAlive).expect("cleanup");

        assert!(workspace_dir(root, stream_id).is_none());
        // State directory survives as history.
        assert!(StreamPaths::new(root, stream_id).dir.is_dir());
    }
}
