//! Pure status derivation for a stream.
//!
//! Status is never stored. It is recomputed from a [`Signals`] snapshot by an
//! explicit, ordered precedence list, so the order itself is unit-testable in
//! isolation from the filesystem and git. Checklist checkboxes are
//! deliberately absent from the signals: they are agent-maintained hints, not
//! proof of work; only committed history and explicit markers are
//! authoritative.

use serde::Serialize;

/// Authoritative stream status, first matching rule wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
    Running,
    Merged,
    Completed,
    InProgress,
    Ready,
    Error,
}

impl DerivedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Merged => "merged",
            Self::Completed => "completed",
            Self::InProgress => "in_progress",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

/// Snapshot of the independently-mutable signals a stream's status derives
/// from. Constructed by `reconcile`, consumed here without further I/O.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    /// Lock file present and its owning process is alive.
    pub lock_held_by_live_process: bool,
    /// `.merged` marker file present.
    pub merged_marker: bool,
    /// The stream branch is an ancestor of the main line.
    pub branch_merged: bool,
    /// `.completed` marker file present.
    pub completed_marker: bool,
    /// At least one ledger-recorded commit is an ancestor of the main line.
    pub ledger_commit_on_mainline: bool,
    /// A progress ledger file exists.
    pub ledger_exists: bool,
    /// A checklist file exists and parses.
    pub checklist_readable: bool,
}

/// Idempotent correction the caller should apply to heal marker drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Ledger commits reached the main line but `.completed` is missing.
    CreateCompletedMarker,
}

/// Ordered precedence: the first predicate that holds decides the status.
const PRECEDENCE: &[(fn(&Signals) -> bool, DerivedStatus)] = &[
    (|s| s.lock_held_by_live_process, DerivedStatus::Running),
    (|s| s.merged_marker || s.branch_merged, DerivedStatus::Merged),
    (
        |s| s.completed_marker || s.ledger_commit_on_mainline,
        DerivedStatus::Completed,
    ),
    (|s| s.ledger_exists, DerivedStatus::InProgress),
    (|s| s.checklist_readable, DerivedStatus::Ready),
];

/// Derive status and any idempotent corrections from a signals snapshot.
///
/// Deterministic: the same signals always produce the same result, and
/// applying the corrections then re-deriving produces the same status with no
/// further corrections.
pub fn derive_status(signals: &Signals) -> (DerivedStatus, Vec<Correction>) {
    let status = PRECEDENCE
        .iter()
        .find(|(predicate, _)| predicate(signals))
        .map(|(_, status)| *status)
        .unwrap_or(DerivedStatus::Error);

    let mut corrections = Vec::new();
    if status == DerivedStatus::Completed
        && signals.ledger_commit_on_mainline
        && !signals.completed_marker
    {
        corrections.push(Correction::CreateCompletedMarker);
    }
    (status, corrections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_wins_over_everything() {
        let signals = Signals {
            lock_held_by_live_process: true,
            merged_marker: true,
            completed_marker: true,
            ledger_exists: true,
            checklist_readable: true,
            ..Signals::default()
        };
        assert_eq!(derive_status(&signals).0, DerivedStatus::Running);
    }

    #[test]
    fn merged_wins_over_completed() {
        let signals = Signals {
            branch_merged: true,
            completed_marker: true,
            ledger_exists: true,
            checklist_readable: true,
            ..Signals::default()
        };
        assert_eq!(derive_status(&signals).0, DerivedStatus::Merged);
    }

    #[test]
    fn mainline_commit_without_marker_is_completed_with_correction() {
        let signals = Signals {
            ledger_commit_on_mainline: true,
            ledger_exists: true,
            checklist_readable: true,
            ..Signals::default()
        };
        let (status, corrections) = derive_status(&signals);
        assert_eq!(status, DerivedStatus::Completed);
        assert_eq!(corrections, vec![Correction::CreateCompletedMarker]);
    }

    #[test]
    fn completed_marker_alone_needs_no_correction() {
        let signals = Signals {
            completed_marker: true,
            ledger_exists: true,
            checklist_readable: true,
            ..Signals::default()
        };
        let (status, corrections) = derive_status(&signals);
        assert_eq!(status, DerivedStatus::Completed);
        assert!(corrections.is_empty());
    }

    #[test]
    fn ledger_without_mainline_commits_is_in_progress() {
        let signals = Signals {
            ledger_exists: true,
            checklist_readable: true,
            ..Signals::default()
        };
        assert_eq!(derive_status(&signals).0, DerivedStatus::InProgress);
    }

    #[test]
    fn checklist_only_is_ready() {
        let signals = Signals {
            checklist_readable: true,
            ..Signals::default()
        };
        assert_eq!(derive_status(&signals).0, DerivedStatus::Ready);
    }

    #[test]
    fn nothing_readable_is_error() {
        assert_eq!(derive_status(&Signals::default()).0, DerivedStatus::Error);
    }

    #[test]
    fn derivation_is_idempotent_after_correction() {
        let mut signals = Signals {
            ledger_commit_on_mainline: true,
            ledger_exists: true,
            checklist_readable: true,
            ..Signals::default()
        };
        let (first, corrections) = derive_status(&signals);
        assert_eq!(corrections.len(), 1);

        // Applying the correction sets the marker; re-deriving is stable.
        signals.completed_marker = true;
        let (second, corrections) = derive_status(&signals);
        assert_eq!(first, second);
        assert!(corrections.is_empty());
    }
}
