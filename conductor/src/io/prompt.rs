//! Composed-instruction builder for agent invocations.
//!
//! Each iteration feeds the agent one rendered prompt referencing the loop's
//! persisted state: the selected story, the checklist, recent ledger entries,
//! and the error window. Sections are marked required or droppable so the
//! prompt can be kept under a byte budget deterministically.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;

use crate::core::checklist::Story;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

/// Selected story context for template rendering.
#[derive(Debug, Clone, Serialize)]
struct StoryContext {
    id: String,
    title: String,
    criteria: Vec<String>,
}

impl StoryContext {
    fn from_story(story: &Story) -> Self {
        Self {
            id: story.id.clone(),
            title: story.title.clone(),
            criteria: story.criteria.iter().map(|c| c.text.clone()).collect(),
        }
    }
}

/// Inputs gathered by the step orchestration.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub stream_id: u32,
    pub agent_name: String,
    pub story: Story,
    /// Full checklist text, verbatim.
    pub checklist: String,
    /// One line per recent iteration, newest first.
    pub history: Vec<String>,
    /// One line per error window entry.
    pub errors: Vec<String>,
}

/// Renders the iteration prompt and enforces the byte budget.
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, inputs: &PromptInputs) -> Result<String> {
        static ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
            let mut env = Environment::new();
            env.add_template("iteration", ITERATION_TEMPLATE)
                .expect("iteration template should be valid");
            env
        });

        let template = ENV.get_template("iteration").context("load template")?;
        let rendered = template
            .render(context! {
                stream_id => inputs.stream_id,
                agent_name => inputs.agent_name,
                story => StoryContext::from_story(&inputs.story),
                checklist => (!inputs.checklist.trim().is_empty()).then(|| inputs.checklist.trim()),
                history => (!inputs.history.is_empty()).then_some(&inputs.history),
                errors => (!inputs.errors.is_empty()).then_some(&inputs.errors),
            })
            .context("render iteration template")?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Full section content, marker excluded.
    content: String,
}

/// Parse sections from rendered output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section regex should be valid")
    });

    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in matches.iter().enumerate() {
        let required = caps
            .get(2)
            .map(|m| m.as_str() == "required")
            .unwrap_or(false);
        let start = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let end = matches
            .get(i + 1)
            .and_then(|m| m.get(0))
            .map(|m| m.start())
            .unwrap_or(rendered.len());

        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection { required, content });
        }
    }

    sections
}

/// Drop droppable sections, last first, until the prompt fits the budget.
///
/// Template order puts the cheapest-to-lose sections last (checklist, then
/// history, then errors, so errors are dropped first).
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    while total(sections) > budget {
        let Some(idx) = sections.iter().rposition(|s| !s.required) else {
            return;
        };
        sections.remove(idx);
    }
}
