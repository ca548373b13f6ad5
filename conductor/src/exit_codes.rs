//! Stable exit codes for conductor CLI commands.

/// The build loop finished with every story satisfied.
pub const COMPLETE: i32 = 0;
/// Unexpected error (lock busy, git failure, corrupt state) or operator abort.
pub const ERROR: i32 = 1;
/// The agent requested human intervention.
pub const NEEDS_HUMAN: i32 = 2;
/// The iteration budget was exhausted without completion.
pub const MAX_ITERATIONS: i32 = 3;
/// The loop made no observable progress and stopped early.
pub const STALLED: i32 = 4;
