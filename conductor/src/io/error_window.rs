//! De-duplicated, size-bounded recent-failure log.
//!
//! One `errors.json` per stream, holding at most three distinct normalized
//! messages. Inserting a duplicate refreshes its timestamp only; a fourth
//! distinct message evicts the oldest entry. The window feeds the agent
//! prompt and the stall detector, nothing else.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum distinct entries retained.
pub const WINDOW_CAPACITY: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Normalized failure message (see `core::normalize`).
    pub message: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorWindow {
    entries: Vec<ErrorEntry>,
}

impl ErrorWindow {
    /// Insert a normalized message observed at `at`.
    ///
    /// Returns `true` when the message was a new distinct entry, `false` when
    /// it refreshed an existing one. Oldest-by-`last_seen` is evicted when
    /// the window would exceed capacity.
    pub fn insert(&mut self, message: String, at: DateTime<Utc>) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.message == message) {
            existing.last_seen = at;
            return false;
        }
        self.entries.push(ErrorEntry {
            message,
            last_seen: at,
        });
        while self.entries.len() > WINDOW_CAPACITY {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            self.entries.remove(oldest);
        }
        true
    }

    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load a window, or an empty one if the file does not exist yet.
pub fn load_or_default(path: &Path) -> Result<ErrorWindow> {
    if !path.exists() {
        return Ok(ErrorWindow::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write the window (temp file + rename).
pub fn write_window(path: &Path, window: &ErrorWindow) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(window)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("error window path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp error window {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace error window {}", path.display()))?;
    Ok(())
}
