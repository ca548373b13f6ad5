//! Orchestration for a single iteration of the build loop.
//!
//! One step: select the next open story, invoke the active agent with a
//! composed instruction, classify its output for sentinels, run verification,
//! mutate the checklist on success, commit the workspace, and append the
//! iteration to the ledger. Transient failures (agent invocation errors,
//! verification failures) are absorbed into the iteration record; only
//! structural failures (corrupt state, git errors) escape as `Err`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::checklist::Checklist;
use crate::core::classifier::{CompletionSignal, classify_output};
use crate::core::normalize::normalize_error;
use crate::io::config::{AgentConfig, ConductorConfig};
use crate::io::error_window::{self, ErrorWindow};
use crate::io::git::Git;
use crate::io::invoker::{AgentInvocationError, AgentInvoker, InvokeRequest};
use crate::io::layout::StreamPaths;
use crate::io::ledger::{self, IterationClass, IterationRecord, Ledger, RECENT_LIMIT};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::verify::{Verifier, VerifyOutcome, VerifyRequest};

/// Maximum bytes for the composed instruction before dropping sections.
const PROMPT_BUDGET_BYTES: usize = 40_000;

/// Characters of detail kept on non-success iteration records.
const DETAIL_CLIP_CHARS: usize = 160;

/// Everything a step needs about its stream, resolved once by the loop.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub paths: StreamPaths,
    /// Where the agent edits and commits happen: the stream's worktree, or
    /// the main checkout for workspace-less streams.
    pub workspace: PathBuf,
    pub config: ConductorConfig,
    /// Suppress commits (dry-run commit policy).
    pub dry_run: bool,
    pub cancel: CancelToken,
}

/// Result of a single iteration, consumed by the loop's policy machinery.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub seq: u64,
    pub story_id: String,
    pub class: IterationClass,
    pub commit: Option<String>,
    pub signal: CompletionSignal,
    /// The verification command exited zero.
    pub verify_passed: bool,
    /// This iteration added a new distinct entry to the error window.
    pub new_distinct_error: bool,
    /// Every story is satisfied after this iteration.
    pub all_satisfied: bool,
}

/// Execute one iteration of the build loop.
#[instrument(skip_all, fields(stream_id = ctx.paths.stream_id, agent = %agent.name))]
pub fn run_step<I: AgentInvoker, V: Verifier>(
    ctx: &StepContext,
    invoker: &I,
    verifier: &V,
    agent: &AgentConfig,
    retries: u32,
) -> Result<StepReport> {
    let started_at = Utc::now();

    let mut checklist = load_checklist(ctx)?;
    let story = checklist
        .next_open_story()
        .ok_or_else(|| anyhow!("no open story (checklist already satisfied)"))?
        .clone();

    let mut ledger = ledger::load_or_default(&ctx.paths.ledger_path)
        .with_context(|| format!("load {}", ctx.paths.ledger_path.display()))?;
    let mut window = error_window::load_or_default(&ctx.paths.errors_path)
        .with_context(|| format!("load {}", ctx.paths.errors_path.display()))?;
    let seq = ledger.next_seq();

    let iter_dir = ctx.paths.iteration_dir(seq);
    fs::create_dir_all(&iter_dir)
        .with_context(|| format!("create iteration dir {}", iter_dir.display()))?;

    let prompt = compose_prompt(ctx, agent, &checklist, &ledger, &window)?;
    fs::write(iter_dir.join("prompt.md"), &prompt)
        .with_context(|| format!("write prompt under {}", iter_dir.display()))?;

    let mut report = StepReport {
        seq,
        story_id: story.id.clone(),
        class: IterationClass::Failure,
        commit: None,
        signal: CompletionSignal::None,
        verify_passed: false,
        new_distinct_error: false,
        all_satisfied: false,
    };

    let finish = |report: &StepReport,
                  ledger: &mut Ledger,
                  window: &ErrorWindow,
                  detail: Option<String>|
     -> Result<()> {
        ledger.append(IterationRecord {
            seq,
            story_id: Some(story.id.clone()),
            agent: agent.name.clone(),
            class: report.class,
            commit: report.commit.clone(),
            retries,
            started_at,
            ended_at: Utc::now(),
            detail,
        });
        ledger::write_ledger(&ctx.paths.ledger_path, ledger)?;
        error_window::write_window(&ctx.paths.errors_path, window)?;
        Ok(())
    };

    if ctx.cancel.is_cancelled() {
        report.class = IterationClass::Aborted;
        finish(
            &report,
            &mut ledger,
            &window,
            Some("cancelled before agent invocation".to_string()),
        )?;
        return Ok(report);
    }

    let invoke_request = InvokeRequest {
        workspace: ctx.workspace.clone(),
        prompt,
        agent: agent.clone(),
        log_path: iter_dir.join("agent.log"),
        timeout: Duration::from_secs(ctx.config.agent_timeout_secs),
        output_limit_bytes: ctx.config.agent_output_limit_bytes,
        cancel: ctx.cancel.clone(),
    };

    let transcript = match invoker.invoke(&invoke_request) {
        Ok(transcript) if transcript.cancelled => {
            report.class = IterationClass::Aborted;
            finish(
                &report,
                &mut ledger,
                &window,
                Some("cancelled during agent invocation".to_string()),
            )?;
            return Ok(report);
        }
        Ok(transcript) => transcript,
        Err(err) => {
            if err.downcast_ref::<AgentInvocationError>().is_none() {
                return Err(err);
            }
            let message = normalize_error(&format!("{err:#}"));
            warn!(err = %message, "agent invocation failed");
            report.new_distinct_error = window.insert(message.clone(), Utc::now());
            finish(&report, &mut ledger, &window, Some(clip(&message)))?;
            return Ok(report);
        }
    };

    let classified = classify_output(&transcript.text);
    report.signal = classified.signal;

    if classified.signal == CompletionSignal::NeedsHuman {
        info!("agent requested human intervention");
        report.class = IterationClass::Escalation;
        finish(
            &report,
            &mut ledger,
            &window,
            Some("agent emitted NEEDS_HUMAN".to_string()),
        )?;
        return Ok(report);
    }

    let verify_request = VerifyRequest {
        workspace: ctx.workspace.clone(),
        log_path: iter_dir.join("verify.log"),
        timeout: Duration::from_secs(ctx.config.verify_timeout_secs),
        output_limit_bytes: ctx.config.verify_output_limit_bytes,
        cancel: ctx.cancel.clone(),
    };

    match verifier.verify(&verify_request)? {
        VerifyOutcome::Cancelled => {
            report.class = IterationClass::Aborted;
            finish(
                &report,
                &mut ledger,
                &window,
                Some("cancelled during verification".to_string()),
            )?;
            Ok(report)
        }
        VerifyOutcome::Pass => {
            report.verify_passed = true;

            // A COMPLETE claim is honored only if the checklist agrees once
            // this story is marked. A premature claim invalidates the
            // iteration: the story stays open and the claim lands in the
            // error window.
            let premature = classified.signal == CompletionSignal::Complete && {
                let mut probe = checklist.clone();
                probe.mark_satisfied(&story.id)?;
                !probe.all_satisfied()
            };
            if premature {
                warn!(story_id = %story.id, "premature completion claim");
                let message =
                    normalize_error("agent declared LOOP_COMPLETE with unsatisfied stories");
                report.new_distinct_error = window.insert(message.clone(), Utc::now());
                finish(&report, &mut ledger, &window, Some(clip(&message)))?;
                return Ok(report);
            }

            checklist.mark_satisfied(&story.id)?;
            write_checklist(ctx, &checklist)?;
            report.commit = commit_workspace(ctx, seq, &story.id)?;
            report.class = IterationClass::Success;
            report.all_satisfied = checklist.all_satisfied();
            debug!(story_id = %story.id, commit = ?report.commit, "story satisfied");
            finish(&report, &mut ledger, &window, None)?;
            Ok(report)
        }
        VerifyOutcome::Fail { output } => {
            let message = normalize_error(&output);
            report.new_distinct_error = window.insert(message.clone(), Utc::now());
            debug!(story_id = %story.id, "verification failed");
            finish(&report, &mut ledger, &window, Some(clip(&message)))?;
            Ok(report)
        }
    }
}

/// Load and parse the stream's checklist.
pub fn load_checklist(ctx: &StepContext) -> Result<Checklist> {
    let path = &ctx.paths.checklist_path;
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Checklist::parse(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write the checklist back (temp file + rename).
fn write_checklist(ctx: &StepContext, checklist: &Checklist) -> Result<()> {
    let path = &ctx.paths.checklist_path;
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, checklist.render())
        .with_context(|| format!("write temp checklist {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn compose_prompt(
    ctx: &StepContext,
    agent: &AgentConfig,
    checklist: &Checklist,
    ledger: &Ledger,
    window: &ErrorWindow,
) -> Result<String> {
    let story = checklist
        .next_open_story()
        .ok_or_else(|| anyhow!("no open story for prompt"))?;
    let history = ledger.newest(RECENT_LIMIT).map(record_line).collect();
    let errors = window
        .entries()
        .iter()
        .map(|e| format!("[{}] {}", e.last_seen.format("%Y-%m-%d %H:%M:%S"), e.message))
        .collect();
    PromptBuilder::new(PROMPT_BUDGET_BYTES).build(&PromptInputs {
        stream_id: ctx.paths.stream_id,
        agent_name: agent.name.clone(),
        story: story.clone(),
        checklist: checklist.render(),
        history,
        errors,
    })
}

fn record_line(record: &IterationRecord) -> String {
    let story = record.story_id.as_deref().unwrap_or("-");
    let mut line = format!(
        "iter {} [{}] {} via {}",
        record.seq,
        record.class.as_str(),
        story,
        record.agent
    );
    if let Some(detail) = &record.detail {
        line.push_str(": ");
        line.push_str(detail);
    }
    line
}

fn commit_workspace(ctx: &StepContext, seq: u64, story_id: &str) -> Result<Option<String>> {
    if ctx.dry_run {
        debug!("dry run, skipping commit");
        return Ok(None);
    }
    let git = Git::new(&ctx.workspace);
    git.add_all()?;
    let message = format!(
        "chore(stream-{}): iter {seq} {story_id} verify=pass",
        ctx.paths.stream_id
    );
    if !git.commit_staged(&message)? {
        return Ok(None);
    }
    Ok(Some(git.head_short_sha(12)?))
}

fn clip(message: &str) -> String {
    if message.chars().count() <= DETAIL_CLIP_CHARS {
        return message.to_string();
    }
    message.chars().take(DETAIL_CLIP_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::COMPLETE_SENTINEL;
    use crate::test_support::{ScriptedInvoker, ScriptedVerifier, TestRepo};

    fn two_story_checklist() -> &'static str {
        "- [ ] First story\n  - [ ] criterion one\n- [ ] Second story\n"
    }

    #[test]
    fn successful_iteration_marks_story_and_appends_ledger() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = repo.new_stream(two_story_checklist()).expect("stream");
        let ctx = repo.step_context(stream_id);

        let invoker = ScriptedInvoker::with_outputs(vec!["did the work"]);
        let verifier = ScriptedVerifier::passing();
        let agent = ctx.config.agents[0].clone();

        let report = run_step(&ctx, &invoker, &verifier, &agent, 0).expect("step");

        assert_eq!(report.class, IterationClass::Success);
        assert_eq!(report.story_id, "s1");
        assert!(!report.all_satisfied);

        let checklist = load_checklist(&ctx).expect("checklist");
        assert!(checklist.stories()[0].satisfied());
        assert!(!checklist.stories()[1].satisfied());

        let ledger = ledger::load_or_default(&ctx.paths.ledger_path).expect("ledger");
        assert_eq!(ledger.recent.len(), 1);
        assert_eq!(ledger.recent[0].class, IterationClass::Success);
        assert_eq!(ledger.next_seq(), 2);

        let iter_dir = ctx.paths.iteration_dir(1);
        assert!(iter_dir.join("prompt.md").is_file());
        assert!(iter_dir.join("agent.log").is_file());
    }

    #[test]
    fn failed_verification_feeds_the_error_window() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = repo.new_stream(two_story_checklist()).expect("stream");
        let ctx = repo.step_context(stream_id);

        let invoker = ScriptedInvoker::with_outputs(vec!["tried"]);
        let verifier = ScriptedVerifier::failing("tests failed: 2 assertions");
        let agent = ctx.config.agents[0].clone();

        let report = run_step(&ctx, &invoker, &verifier, &agent, 0).expect("step");

        assert_eq!(report.class, IterationClass::Failure);
        assert!(report.new_distinct_error);

        let window = error_window::load_or_default(&ctx.paths.errors_path).expect("window");
        assert_eq!(window.entries().len(), 1);
        assert!(window.entries()[0].message.contains("tests failed"));

        let checklist = load_checklist(&ctx).expect("checklist");
        assert!(!checklist.stories()[0].satisfied());
    }

    #[test]
    fn needs_human_escalates_before_verification() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = repo.new_stream(two_story_checklist()).expect("stream");
        let ctx = repo.step_context(stream_id);

        let invoker = ScriptedInvoker::with_outputs(vec!["NEEDS_HUMAN\nmissing credentials"]);
        // A verifier that would pass must not be consulted.
        let verifier = ScriptedVerifier::passing();
        let agent = ctx.config.agents[0].clone();

        let report = run_step(&ctx, &invoker, &verifier, &agent, 0).expect("step");
        assert_eq!(report.class, IterationClass::Escalation);
        assert_eq!(verifier.calls(), 0);
    }

    #[test]
    fn premature_complete_claim_is_a_failed_iteration() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = repo.new_stream(two_story_checklist()).expect("stream");
        let ctx = repo.step_context(stream_id);

        let output = format!("all done! {COMPLETE_SENTINEL}");
        let invoker = ScriptedInvoker::with_outputs(vec![output.as_str()]);
        let verifier = ScriptedVerifier::passing();
        let agent = ctx.config.agents[0].clone();

        let report = run_step(&ctx, &invoker, &verifier, &agent, 0).expect("step");

        assert_eq!(report.class, IterationClass::Failure);
        assert_eq!(report.signal, CompletionSignal::Complete);
        assert!(!report.all_satisfied);

        // The story stays open and the claim lands in the window.
        let checklist = load_checklist(&ctx).expect("checklist");
        assert!(!checklist.stories()[0].satisfied());
        let window = error_window::load_or_default(&ctx.paths.errors_path).expect("window");
        assert!(window.entries()[0].message.contains("LOOP_COMPLETE"));
    }

    #[test]
    fn complete_claim_on_last_story_is_honored() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = repo.new_stream("- [ ] Only story\n").expect("stream");
        let ctx = repo.step_context(stream_id);

        let output = format!("{COMPLETE_SENTINEL}\n");
        let invoker = ScriptedInvoker::with_outputs(vec![output.as_str()]);
        let verifier = ScriptedVerifier::passing();
        let agent = ctx.config.agents[0].clone();

        let report = run_step(&ctx, &invoker, &verifier, &agent, 0).expect("step");
        assert_eq!(report.class, IterationClass::Success);
        assert!(report.all_satisfied);
        assert_eq!(report.signal, CompletionSignal::Complete);
    }

    #[test]
    fn agent_invocation_error_is_recorded_not_raised() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = repo.new_stream(two_story_checklist()).expect("stream");
        let ctx = repo.step_context(stream_id);

        let invoker = ScriptedInvoker::erroring("spawn failed");
        let verifier = ScriptedVerifier::passing();
        let agent = ctx.config.agents[0].clone();

        let report = run_step(&ctx, &invoker, &verifier, &agent, 0).expect("step");
        assert_eq!(report.class, IterationClass::Failure);
        assert!(report.new_distinct_error);
        assert_eq!(verifier.calls(), 0);

        let window = error_window::load_or_default(&ctx.paths.errors_path).expect("window");
        assert!(window.entries()[0].message.contains("spawn failed"));
    }

    #[test]
    fn pre_cancelled_step_writes_partial_aborted_record() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = repo.new_stream(two_story_checklist()).expect("stream");
        let ctx = repo.step_context(stream_id);
        ctx.cancel.cancel();

        let invoker = ScriptedInvoker::with_outputs(vec!["never runs"]);
        let verifier = ScriptedVerifier::passing();
        let agent = ctx.config.agents[0].clone();

        let report = run_step(&ctx, &invoker, &verifier, &agent, 0).expect("step");
        assert_eq!(report.class, IterationClass::Aborted);
        assert_eq!(invoker.calls(), 0);

        let ledger = ledger::load_or_default(&ctx.paths.ledger_path).expect("ledger");
        assert_eq!(ledger.recent[0].class, IterationClass::Aborted);
    }

    #[test]
    fn dry_run_suppresses_commits() {
        let repo = TestRepo::new().expect("repo");
        let stream_id = repo.new_stream(two_story_checklist()).expect("stream");
        let mut ctx = repo.step_context(stream_id);
        ctx.dry_run = true;

        let invoker = ScriptedInvoker::with_outputs(vec!["worked"]).touching("artifact.txt");
        let verifier = ScriptedVerifier::passing();
        let agent = ctx.config.agents[0].clone();

        let report = run_step(&ctx, &invoker, &verifier, &agent, 0).expect("step");
        assert_eq!(report.class, IterationClass::Success);
        assert_eq!(report.commit, None);
    }
}
