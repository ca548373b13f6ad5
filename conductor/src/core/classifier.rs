//! Completion-sentinel classification of agent output.
//!
//! The agent contract is exact-substring: somewhere in its output stream the
//! agent may emit zero or one sentinel, distinguishable from ordinary prose.
//! Classification produces a tagged result instead of letting callers scan
//! free-form text themselves.

/// Emitted by the agent when it believes every story is satisfied.
///
/// The sentinel alone is not trusted: the loop honors it only when the
/// checklist agrees.
pub const COMPLETE_SENTINEL: &str = "LOOP_COMPLETE";

/// Emitted by the agent when it needs operator input. Honored immediately,
/// regardless of checklist state.
pub const NEEDS_HUMAN_SENTINEL: &str = "NEEDS_HUMAN";

/// Tagged completion signal scanned from agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    Complete,
    NeedsHuman,
    None,
}

/// Agent output paired with its classified signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedOutput {
    pub signal: CompletionSignal,
    pub raw: String,
}

/// Scan raw output for completion sentinels.
///
/// `NEEDS_HUMAN` wins over `LOOP_COMPLETE` when both appear: escalation is
/// honored unconditionally, completion is not.
pub fn classify_output(raw: &str) -> ClassifiedOutput {
    let signal = if raw.contains(NEEDS_HUMAN_SENTINEL) {
        CompletionSignal::NeedsHuman
    } else if raw.contains(COMPLETE_SENTINEL) {
        CompletionSignal::Complete
    } else {
        CompletionSignal::None
    };
    ClassifiedOutput {
        signal,
        raw: raw.to_string(),
    }
}
