//! Append-only progress ledger with bounded growth.
//!
//! One `ledger.json` per stream. The newest five iterations keep full detail;
//! everything older is folded into a single rolled-up summary block. The file
//! grows monotonically and is never truncated below the summary. Commit ids
//! are additionally accumulated verbatim, because reconciliation needs them
//! after the records that carried them have been collapsed.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Iterations retained with full detail.
pub const RECENT_LIMIT: usize = 5;

/// Exit classification of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationClass {
    /// Verification passed and the story was marked satisfied.
    Success,
    /// Verification failed, the agent could not be invoked, or the agent made
    /// a premature completion claim.
    Failure,
    /// The agent requested human intervention.
    Escalation,
    /// The iteration was interrupted by operator cancellation.
    Aborted,
}

impl IterationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Escalation => "escalation",
            Self::Aborted => "aborted",
        }
    }
}

/// One invocation of the agent, immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-indexed sequence number, strictly increasing per stream.
    pub seq: u64,
    /// Story targeted by this iteration, if one was selected.
    pub story_id: Option<String>,
    /// Agent from the fallback chain that ran.
    pub agent: String,
    pub class: IterationClass,
    /// Short SHA of the commit made by this iteration, if any.
    pub commit: Option<String>,
    /// Consecutive-failure count consumed on the active agent before this
    /// iteration ran.
    pub retries: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// One-line explanation for non-success records.
    pub detail: Option<String>,
}

/// Rolled-up block covering every iteration older than [`RECENT_LIMIT`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub iterations: u64,
    pub successes: u64,
    pub failures: u64,
    pub escalations: u64,
    pub aborted: u64,
    pub first_seq: u64,
    pub last_seq: u64,
}

/// Agent fallback switch, appended when the consecutive-failure threshold trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchEvent {
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub iteration: u64,
    pub at: DateTime<Utc>,
}

/// Iteration history for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub summary: Option<LedgerSummary>,
    pub recent: Vec<IterationRecord>,
    pub switches: Vec<SwitchEvent>,
    /// Every commit id ever recorded, oldest first.
    pub commits: Vec<String>,
}

impl Ledger {
    /// Sequence number for the next iteration.
    pub fn next_seq(&self) -> u64 {
        self.recent
            .last()
            .map(|r| r.seq)
            .or_else(|| self.summary.as_ref().map(|s| s.last_seq))
            .unwrap_or(0)
            + 1
    }

    /// Append a record, folding overflow into the summary block.
    pub fn append(&mut self, record: IterationRecord) {
        if let Some(commit) = &record.commit {
            self.commits.push(commit.clone());
        }
        self.recent.push(record);
        while self.recent.len() > RECENT_LIMIT {
            let oldest = self.recent.remove(0);
            let summary = self.summary.get_or_insert_with(|| LedgerSummary {
                first_seq: oldest.seq,
                ..LedgerSummary::default()
            });
            summary.iterations += 1;
            summary.last_seq = oldest.seq;
            match oldest.class {
                IterationClass::Success => summary.successes += 1,
                IterationClass::Failure => summary.failures += 1,
                IterationClass::Escalation => summary.escalations += 1,
                IterationClass::Aborted => summary.aborted += 1,
            }
        }
    }

    pub fn record_switch(&mut self, event: SwitchEvent) {
        self.switches.push(event);
    }

    /// Newest records first, capped at `n`. Used for prompt composition.
    pub fn newest(&self, n: usize) -> impl Iterator<Item = &IterationRecord> {
        self.recent.iter().rev().take(n)
    }
}

/// Load a ledger, or an empty one if the file does not exist yet.
pub fn load_or_default(path: &Path) -> Result<Ledger> {
    if !path.exists() {
        return Ok(Ledger::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write the ledger (temp file + rename).
pub fn write_ledger(path: &Path, ledger: &Ledger) -> Result<()> {
    debug!(path = %path.display(), next_seq = ledger.next_seq(), "writing ledger");
    let mut buf = serde_json::to_string_pretty(ledger)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("ledger path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp ledger {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace ledger {}", path.display()))?;
    Ok(())
}
