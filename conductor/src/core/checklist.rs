//! Task checklist parsing and mutation.
//!
//! A checklist is a markdown file with one checkbox-coded story line per
//! top-level `- [ ]` entry, each optionally followed by indented criterion
//! lines. Parsing keeps the original lines so checkbox flips rewrite only the
//! markers, never the surrounding prose. Story ids are positional (`s1`,
//! `s2`, ...), assigned in file order.

use anyhow::{Result, anyhow};

/// One acceptance criterion of a story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    pub text: String,
    pub done: bool,
    line: usize,
}

/// One story: a checkbox-coded title plus its acceptance criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub done: bool,
    pub criteria: Vec<Criterion>,
    line: usize,
}

impl Story {
    /// A story is satisfied when its own box and every criterion box are checked.
    pub fn satisfied(&self) -> bool {
        self.done && self.criteria.iter().all(|c| c.done)
    }
}

/// Parsed checklist. Holds the original lines for lossless rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checklist {
    lines: Vec<String>,
    stories: Vec<Story>,
}

impl Checklist {
    /// Parse checklist text. Errors if no story lines are present.
    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let mut stories: Vec<Story> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            if let Some((done, title)) = parse_marker_line(line, false) {
                stories.push(Story {
                    id: format!("s{}", stories.len() + 1),
                    title,
                    done,
                    criteria: Vec::new(),
                    line: idx,
                });
            } else if let Some((done, text)) = parse_marker_line(line, true) {
                let Some(story) = stories.last_mut() else {
                    return Err(anyhow!(
                        "criterion before any story at line {}: '{line}'",
                        idx + 1
                    ));
                };
                story.criteria.push(Criterion {
                    text,
                    done,
                    line: idx,
                });
            }
        }

        if stories.is_empty() {
            return Err(anyhow!("checklist contains no story lines"));
        }
        Ok(Self { lines, stories })
    }

    /// Render back to text. Unchanged lines are preserved byte-for-byte.
    pub fn render(&self) -> String {
        let mut buf = self.lines.join("\n");
        buf.push('\n');
        buf
    }

    pub fn stories(&self) -> &[Story] {
        &self.stories
    }

    /// First story that is not yet satisfied, in file order.
    ///
    /// Earlier stories are always attempted before later ones; there is no
    /// reordering by difficulty.
    pub fn next_open_story(&self) -> Option<&Story> {
        self.stories.iter().find(|s| !s.satisfied())
    }

    pub fn all_satisfied(&self) -> bool {
        self.stories.iter().all(Story::satisfied)
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    /// Check the story's box and every criterion box.
    pub fn mark_satisfied(&mut self, story_id: &str) -> Result<()> {
        let story = self
            .stories
            .iter_mut()
            .find(|s| s.id == story_id)
            .ok_or_else(|| anyhow!("unknown story id '{story_id}'"))?;

        check_line(&mut self.lines[story.line]);
        story.done = true;
        for criterion in &mut story.criteria {
            check_line(&mut self.lines[criterion.line]);
            criterion.done = true;
        }
        Ok(())
    }
}

/// Parse a `- [ ]`/`- [x]` line. `indented` selects criterion lines (leading
/// whitespace required) vs story lines (column zero).
fn parse_marker_line(line: &str, indented: bool) -> Option<(bool, String)> {
    let stripped = line.trim_start();
    let has_indent = stripped.len() < line.len();
    if has_indent != indented {
        return None;
    }
    let rest = stripped.strip_prefix("- [")?;
    let (mark, rest) = rest.split_at_checked(1)?;
    let text = rest.strip_prefix("] ")?;
    let done = match mark {
        " " => false,
        "x" | "X" => true,
        _ => return None,
    };
    Some((done, text.trim().to_string()))
}

/// Flip the first `[ ]` in a line to `[x]`. No-op if already checked.
fn check_line(line: &mut String) {
    if let Some(pos) = line.find("[ ]") {
        line.replace_range(pos..pos + 3, "[x]");
    }
}
