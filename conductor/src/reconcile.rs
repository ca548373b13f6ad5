//! Status reconciliation engine.
//!
//! Derives each stream's authoritative status from several
//! independently-mutable, weakly-consistent signals: the lock file, committed
//! history, marker files, and the progress ledger. Gathering constructs an
//! explicit [`Signals`] snapshot; derivation itself is the pure precedence in
//! `core::status`. Corrections are idempotent marker creation only; history
//! is never rewritten and nothing is ever deleted. Reconciliation is queried
//! on demand and never blocks a running loop.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::checklist::Checklist;
use crate::core::status::{self, DerivedStatus, Signals};
use crate::io::config::load_config;
use crate::io::git::Git;
use crate::io::layout::{ConductorPaths, StreamPaths, stream_ids, write_marker};
use crate::io::ledger;
use crate::io::lock::{LockManager, ProcessProbe};

/// One correction applied during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub stream_id: u32,
    pub action: CorrectionAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionAction {
    /// Ledger commits were found on the main line but `.completed` was
    /// missing; the marker was created.
    CreatedCompletedMarker,
}

impl fmt::Display for CorrectionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreatedCompletedMarker => write!(f, "created .completed marker"),
        }
    }
}

/// Build the signals snapshot for one stream.
#[instrument(skip_all, fields(stream_id))]
pub fn gather_signals<P: ProcessProbe>(
    root: &Path,
    stream_id: u32,
    probe: &P,
) -> Result<Signals> {
    let conductor = ConductorPaths::new(root);
    let paths = StreamPaths::new(root, stream_id);
    let git = Git::new(root);

    let lock_manager = LockManager::new(&conductor.locks_dir, probe);
    let lock_held_by_live_process = lock_manager.is_held_by_live_process(stream_id)?;

    let config = load_config(&conductor.config_path)
        .with_context(|| format!("load {}", conductor.config_path.display()))?;
    let mainline = if config.mainline.is_empty() {
        git.detect_mainline()?
    } else {
        config.mainline.clone()
    };

    let ledger_exists = paths.ledger_path.is_file();
    let ledger = ledger::load_or_default(&paths.ledger_path)
        .with_context(|| format!("load {}", paths.ledger_path.display()))?;

    // A branch that never carried work is an ancestor of the main line from
    // birth; ancestry only counts as a merge once the ledger recorded commits.
    let branch = paths.branch();
    let branch_merged = !ledger.commits.is_empty()
        && git.branch_exists(&branch)?
        && git.is_ancestor(&branch, &mainline)?;

    let mut ledger_commit_on_mainline = false;
    for commit in ledger.commits.iter().rev() {
        if !git.commit_exists(commit)? {
            continue;
        }
        if git.is_ancestor(commit, &mainline)? {
            ledger_commit_on_mainline = true;
            break;
        }
    }

    let checklist_readable = match std::fs::read_to_string(&paths.checklist_path) {
        Ok(contents) => Checklist::parse(&contents).is_ok(),
        Err(_) => false,
    };

    let signals = Signals {
        lock_held_by_live_process,
        merged_marker: paths.merged_marker.is_file(),
        branch_merged,
        completed_marker: paths.completed_marker.is_file(),
        ledger_commit_on_mainline,
        ledger_exists,
        checklist_readable,
    };
    debug!(?signals, "signals gathered");
    Ok(signals)
}

/// Derive one stream's status, applying idempotent corrections as a side
/// effect (missing `.completed` marker creation).
pub fn status<P: ProcessProbe>(root: &Path, stream_id: u32, probe: &P) -> Result<DerivedStatus> {
    let (derived, _) = status_with_corrections(root, stream_id, probe)?;
    Ok(derived)
}

/// Sweep every stream and return the corrections applied.
///
/// Calling this twice in a row with no intervening state change applies zero
/// corrections on the second call.
#[instrument(skip_all)]
pub fn verify_all<P: ProcessProbe>(root: &Path, probe: &P) -> Result<Vec<Correction>> {
    let mut corrections = Vec::new();
    for stream_id in stream_ids(root)? {
        let (_, applied) = status_with_corrections(root, stream_id, probe)?;
        corrections.extend(applied);
    }
    if !corrections.is_empty() {
        info!(count = corrections.len(), "corrections applied");
    }
    Ok(corrections)
}

fn status_with_corrections<P: ProcessProbe>(
    root: &Path,
    stream_id: u32,
    probe: &P,
) -> Result<(DerivedStatus, Vec<Correction>)> {
    let signals = gather_signals(root, stream_id, probe)?;
    let (derived, needed) = status::derive_status(&signals);

    let paths = StreamPaths::new(root, stream_id);
    let mut applied = Vec::new();
    for correction in needed {
        match correction {
            status::Correction::CreateCompletedMarker => {
                info!(stream_id, "healing missing .completed marker");
                write_marker(&paths.completed_marker)?;
                applied.push(Correction {
                    stream_id,
                    action: CorrectionAction::CreatedCompletedMarker,
                });
            }
        }
    }
    Ok((derived, applied))
}
